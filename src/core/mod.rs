//! Domain value types shared by exchange adapters
//!
//! - Side, AssetType, Pair: instrument vocabulary
//! - FundingData, KlineData, WebsocketPositionUpdated: decoded feed records
//! - UnhandledMessageWarning: frames no decoder claimed

pub mod market_data;

pub use market_data::{
    timestamp_from_millis, AssetType, FundingData, KlineData, Pair, Side,
    UnhandledMessageWarning, WebsocketPositionUpdated,
};
