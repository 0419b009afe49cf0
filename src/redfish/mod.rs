pub mod proxy;
pub mod targets;

pub use proxy::{handle_request, RedfishState, REAL_IP_HEADER, TARGET_URL_HEADER};
pub use targets::TargetMap;
