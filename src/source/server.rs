//! Server half of the remote brick protocol (ยง6.2): a thread-per-connection
//! TCP listener serving `LIST` / `OPEN <id>` / `GETBRICK <index>` against a
//! fixed set of local brick files.
//!
//! Grounded in the teacher's debug-server accept loop
//! (`rktri-debug/src/server.rs`), translated from a tokio task-per-connection
//! model to blocking `std::net`/`std::thread`, since nothing else in this
//! crate needs an async runtime.

use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::protocol;
use crate::core::error::{Error, Result};
use crate::format::header::{write_metadata_block, BrickMeta};
use crate::format::reader::BrickFile;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

struct Dataset {
    id: u32,
    description: String,
    file: BrickFile,
}

/// A registry of locally-opened brick files, servable over TCP.
pub struct Server {
    datasets: Vec<Dataset>,
}

impl Server {
    pub fn new() -> Self {
        Self { datasets: Vec::new() }
    }

    /// Register a dataset under `id`. `description` is what `LIST` reports.
    pub fn add_dataset(&mut self, id: u32, description: impl Into<String>, file: BrickFile) {
        self.datasets.push(Dataset {
            id,
            description: description.into(),
            file,
        });
    }

    /// Bind `addr` and serve connections until the listener errors. Each
    /// connection is handled on its own thread.
    pub fn serve(self: Arc<Self>, addr: impl ToSocketAddrs) -> Result<()> {
        let listener = TcpListener::bind(addr).map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        log::info!("brick server listening");

        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    log::error!("accept error: {e}");
                    continue;
                }
            };
            let server = self.clone();
            thread::spawn(move || {
                let peer = stream.peer_addr().ok();
                if let Err(e) = server.handle_connection(stream) {
                    log::warn!("connection from {peer:?} ended: {e}");
                }
            });
        }

        Ok(())
    }

    fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        stream
            .set_read_timeout(Some(CONNECTION_TIMEOUT))
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        let mut opened: Option<usize> = None;

        loop {
            let line = match protocol::read_line(&mut stream) {
                Ok(l) => l,
                Err(_) => return Ok(()),
            };

            if line == protocol::LIST {
                self.handle_list(&mut stream)?;
            } else if let Some(rest) = line.strip_prefix("OPEN ") {
                let Ok(id) = rest.trim().parse::<u32>() else {
                    return Ok(());
                };
                match self.datasets.iter().position(|d| d.id == id) {
                    Some(idx) => {
                        opened = Some(idx);
                        self.handle_open(&mut stream, idx)?;
                    }
                    None => return Ok(()),
                }
            } else if let Some(rest) = line.strip_prefix("GETBRICK ") {
                let Ok(index) = rest.trim().parse::<u32>() else {
                    return Ok(());
                };
                match opened {
                    Some(idx) => self.handle_getbrick(&mut stream, idx, index)?,
                    None => return Ok(()),
                }
            } else {
                // Unknown command closes the connection (ยง6.2).
                return Ok(());
            }
        }
    }

    fn handle_list(&self, stream: &mut TcpStream) -> Result<()> {
        for dataset in &self.datasets {
            protocol::write_line(stream, &format!("{} {}", dataset.id, dataset.description))?;
        }
        protocol::write_line(stream, "")?;
        Ok(())
    }

    fn handle_open(&self, stream: &mut TcpStream, idx: usize) -> Result<()> {
        let file = &self.datasets[idx].file;
        let bricks: Vec<BrickMeta> = (0..file.brick_count())
            .map(|id| *file.brick_meta(id).expect("id in range"))
            .collect();
        let metadata = write_metadata_block(file.metadata(), &bricks);
        protocol::write_frame(stream, &metadata)
    }

    fn handle_getbrick(&self, stream: &mut TcpStream, idx: usize, index: u32) -> Result<()> {
        let file = &self.datasets[idx].file;
        let mut raw = Vec::new();
        file.get_brick_raw(index, &mut raw)?;
        protocol::write_frame(stream, &raw)
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}
