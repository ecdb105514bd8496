pub mod intraday;

pub use intraday::{IntradayRequest, IntradayResponse, IntradayService, ServiceError};
