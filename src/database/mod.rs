mod driver;
mod mysql;

pub use driver::{BinlogPosition, DatabaseDriver, DumpWriter};
pub use mysql::MysqlDriver;

use crate::config::MysqlConfig;
use crate::error::Result;

pub fn create_driver(config: &MysqlConfig) -> Result<Box<dyn DatabaseDriver>> {
    let driver = MysqlDriver::new(config)?;
    Ok(Box::new(driver))
}
