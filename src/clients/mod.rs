pub mod gateway;
pub mod messenger;
pub mod mock;

pub use gateway::{DataGateway, DataOp, HttpDataGateway, NullDataGateway};
pub use messenger::{ApiResponse, ConsoleMessenger, HttpMessenger, Messenger};
