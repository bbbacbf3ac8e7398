//! A `DataSource` backed directly by a local, memory-mapped brick file.

use std::path::Path;

use super::DataSource;
use crate::core::error::Result;
use crate::format::header::BrickFileHeader;
use crate::format::reader::BrickFile;

pub struct LocalDataSource {
    file: BrickFile,
}

impl LocalDataSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: BrickFile::open(path)?,
        })
    }
}

impl DataSource for LocalDataSource {
    fn metadata(&self) -> &BrickFileHeader {
        self.file.metadata()
    }

    fn brick(&self, id: u32, out: &mut Vec<u8>) -> Result<()> {
        self.file.get_brick(id, out)
    }
}
