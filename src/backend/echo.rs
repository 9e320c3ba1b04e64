//! Echo protocol: copies bytes back until the peer closes.

use std::io::{ErrorKind, Read, Write};

use super::{Connection, Protocol};
use crate::log::Level;
use crate::types::{BackendConfig, Result};

#[derive(Debug, Default)]
pub struct Echo {
    name: String,
}

impl Protocol for Echo {
    fn init(&mut self, name: &str, _config: &BackendConfig) -> Result<()> {
        self.name = name.to_string();
        Ok(())
    }

    fn serve(&mut self, conn: &mut Connection<'_>) -> Result<()> {
        let mut buf = [0u8; 4096];
        let mut total = 0usize;
        loop {
            let n = match conn.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            conn.write_all(&buf[..n])?;
            total += n;
        }
        conn.flush()?;

        let line = format!("{} {} echoed {} bytes", self.name, conn.peer(), total);
        conn.log(Level::Debug, &line)
    }
}
