use actix_web::{error, http::StatusCode, HttpResponse};
use derive_more::derive::{Display, Error};
use serde_json::json;

#[derive(Debug, Display, Error)]
pub enum ControllerError {
    #[display("internal error")]
    InternalError,

    #[display("bad request")]
    BadClientData,

    #[display("blocked by policy")]
    Blocked,
}

impl error::ResponseError for ControllerError {
    fn error_response(&self) -> HttpResponse {
        let code = match self {
            ControllerError::InternalError => "INTERNAL",
            ControllerError::BadClientData => "PARSE",
            ControllerError::Blocked => "BLOCKED",
        };
        HttpResponse::build(self.status_code()).json(json!({
            "code": code,
            "message": self.to_string(),
        }))
    }

    fn status_code(&self) -> StatusCode {
        match *self {
            ControllerError::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ControllerError::BadClientData => StatusCode::BAD_REQUEST,
            ControllerError::Blocked => StatusCode::FORBIDDEN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::error::ResponseError;

    #[test]
    fn test_status_codes() {
        assert_eq!(ControllerError::BadClientData.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ControllerError::Blocked.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            ControllerError::InternalError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
