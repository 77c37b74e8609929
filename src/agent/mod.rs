pub mod types;
pub mod data_fetcher;
pub mod pool;
pub mod scanner;
pub mod prompt;
pub mod ai_client;
pub mod parser;
pub mod validator;
pub mod feedback;
pub mod executor;
pub mod observer;
pub mod trading_agent;
pub mod manager;

pub use trading_agent::TradingAgent;
pub use types::*;
