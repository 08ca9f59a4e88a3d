//! Serial port channel.

use std::time::Duration;

use log::{debug, info};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::config::SerialConfig;
use crate::error::{Result, TransportError};

/// Open a serial port, retrying once a second for `wait_secs` while the
/// device node does not exist or cannot be opened.
pub async fn open_serial(config: &SerialConfig) -> Result<SerialStream> {
    let mut attempt = 0;
    loop {
        match try_open(config) {
            Ok(stream) => {
                debug!("opened {} at {} baud", config.device, config.baud_rate);
                return Ok(stream);
            }
            Err(e) if attempt < config.wait_secs => {
                if attempt == 0 {
                    info!(
                        "waiting {} seconds for {} ({})",
                        config.wait_secs, config.device, e
                    );
                }
                attempt += 1;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn try_open(config: &SerialConfig) -> std::result::Result<SerialStream, TransportError> {
    #[allow(unused_mut)]
    let mut stream = tokio_serial::new(&config.device, config.baud_rate)
        .open_native_async()
        .map_err(TransportError::Serial)?;

    #[cfg(unix)]
    stream
        .set_exclusive(config.exclusive)
        .map_err(TransportError::Serial)?;

    Ok(stream)
}
