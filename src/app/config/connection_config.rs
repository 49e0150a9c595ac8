use std::env;

pub struct ConnAttr {
    pub host: String,
    pub tcp_port: u16,
    pub http_port: u16,
}

impl ConnAttr {
    /// Ports come from the CLI; the bind host may be overridden with
    /// APP_HOST (optionally via a .env file).
    pub fn resolve(tcp_port: u16, http_port: u16) -> Self {
        dotenvy::dotenv().ok();

        let host = env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        ConnAttr {
            host,
            tcp_port,
            http_port,
        }
    }

    pub fn tcp_address(&self) -> String {
        format!("{}:{}", self.host, self.tcp_port)
    }

    pub fn http_address(&self) -> (String, u16) {
        (self.host.clone(), self.http_port)
    }
}
