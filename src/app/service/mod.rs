pub mod bypass_engine;
pub mod card_analyzer;
pub mod frame_codec;
pub mod policy_store;
pub mod relay_core;
pub mod tlv_codec;
