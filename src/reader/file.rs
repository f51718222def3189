use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom},
    path::Path,
};

use log::debug;
use serde_json::Value;

use super::{Decode, DecodeError, Sweep, SweepMember};

/// `(name, size, offset, offset_data)` of one member inside an uncompressed tar.
type MemberInfo = (String, u64, u64, u64);

/// Reference decoder.
///
/// Without `tarinfo` the whole file becomes a single member named after the file.
/// With `tarinfo` of the form `{"Z": [name, size, offset, offset_data], ...}`,
/// each listed member is read straight from `offset_data` in the archive, so no
/// listing pass over the tar is needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileDecoder;

impl FileDecoder {
    pub fn read(&self, path: &str, tarinfo: Option<&Value>) -> Result<Sweep, DecodeError> {
        let mut file = BufReader::new(File::open(path)?);

        let members = match tarinfo {
            None => {
                let mut data = Vec::new();
                file.read_to_end(&mut data)?;
                let name = Path::new(path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.to_string());
                vec![SweepMember {
                    symbol: String::new(),
                    name,
                    data,
                }]
            }
            Some(info) => {
                let listing: BTreeMap<String, MemberInfo> = serde_json::from_value(info.clone())?;
                let mut members = Vec::with_capacity(listing.len());
                for (symbol, (name, size, _, offset_data)) in listing {
                    file.seek(SeekFrom::Start(offset_data))?;
                    // `size` comes from the client; never allocate more than the file holds.
                    let mut data = Vec::new();
                    (&mut file).take(size).read_to_end(&mut data)?;
                    if (data.len() as u64) < size {
                        return Err(io::Error::new(
                            ErrorKind::UnexpectedEof,
                            format!("{name} ends after {} of {size} bytes", data.len()),
                        )
                        .into());
                    }
                    members.push(SweepMember { symbol, name, data });
                }
                members
            }
        };

        debug!("read {} member(s) from {path}", members.len());
        Ok(Sweep {
            path: path.to_string(),
            members,
        })
    }
}

impl Decode for FileDecoder {
    fn decode(&mut self, path: &str, tarinfo: Option<&Value>) -> Result<Vec<u8>, DecodeError> {
        self.read(path, tarinfo)?.to_bytes()
    }
}
