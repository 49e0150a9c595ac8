pub mod bypass_plan;
pub mod card_info;
pub mod relay;
pub mod wrapper;
