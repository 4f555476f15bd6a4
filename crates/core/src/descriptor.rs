use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const MAGNET_PREFIX: &str = "magnet:?";
const BTIH_PREFIX: &str = "urn:btih:";
const DESCRIPTOR_FILE_ID_LEN: usize = 40;

/// Content identity of a transfer job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Descriptor {
    Magnet {
        uri: String,
    },
    File {
        name: String,
        #[serde(skip)]
        bytes: Vec<u8>,
    },
}

impl Descriptor {
    pub fn magnet(uri: impl Into<String>) -> Result<Self> {
        let uri = uri.into();
        let uri = uri.trim().to_string();
        parse_btih(&uri)?;
        Ok(Self::Magnet { uri })
    }

    pub fn file(name: impl Into<String>, bytes: Vec<u8>) -> Result<Self> {
        let name = name.into();
        if !name.ends_with(".torrent") {
            return Err(Error::InvalidDescriptor {
                message: format!("descriptor file must end with .torrent (got {name:?})"),
            });
        }
        if bytes.is_empty() {
            return Err(Error::InvalidDescriptor {
                message: "descriptor file is empty".to_string(),
            });
        }
        Ok(Self::File { name, bytes })
    }

    /// Identity used to deduplicate submissions of the same content.
    ///
    /// Descriptor files are keyed by a hash of their bytes, not by the info
    /// hash inside them, so a file and a magnet link for the same content
    /// become two jobs.
    pub fn job_id(&self) -> Result<JobId> {
        match self {
            Self::Magnet { uri } => parse_btih(uri).map(JobId),
            Self::File { bytes, .. } => {
                let hex = blake3::hash(bytes).to_hex();
                Ok(JobId(hex[..DESCRIPTOR_FILE_ID_LEN].to_string()))
            }
        }
    }

    /// Human-readable name, if the descriptor carries one.
    pub fn display_name(&self) -> Option<String> {
        match self {
            Self::Magnet { uri } => magnet_params(uri)
                .find(|(k, _)| *k == "dn")
                .map(|(_, v)| percent_decode(v))
                .filter(|v| !v.trim().is_empty()),
            Self::File { name, .. } => name
                .strip_suffix(".torrent")
                .map(|s| s.to_string())
                .filter(|s| !s.is_empty()),
        }
    }
}

fn magnet_params(uri: &str) -> impl Iterator<Item = (&str, &str)> {
    uri.strip_prefix(MAGNET_PREFIX)
        .unwrap_or("")
        .split('&')
        .filter_map(|pair| pair.split_once('='))
}

fn parse_btih(uri: &str) -> Result<String> {
    if !uri.starts_with(MAGNET_PREFIX) {
        return Err(Error::InvalidDescriptor {
            message: "magnet uri must start with \"magnet:?\"".to_string(),
        });
    }

    let hash = magnet_params(uri)
        .filter(|(k, _)| *k == "xt")
        .find_map(|(_, v)| v.strip_prefix(BTIH_PREFIX))
        .ok_or_else(|| Error::InvalidDescriptor {
            message: "magnet uri has no xt=urn:btih: parameter".to_string(),
        })?;

    let valid = match hash.len() {
        40 => hex::decode(hash).is_ok(),
        32 => hash
            .chars()
            .all(|c| c.is_ascii_alphabetic() || ('2'..='7').contains(&c)),
        _ => false,
    };
    if !valid {
        return Err(Error::InvalidDescriptor {
            message: format!("btih must be 40 hex or 32 base32 chars (got {hash:?})"),
        });
    }

    Ok(hash.to_ascii_lowercase())
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match hex::decode(&bytes[i + 1..i + 3]) {
                    Ok(b) => {
                        out.extend_from_slice(&b);
                        i += 3;
                        continue;
                    }
                    Err(_) => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "0123456789ABCDEF0123456789ABCDEF01234567";

    #[test]
    fn magnet_identity_is_lowercased_btih() {
        let d = Descriptor::magnet(format!("magnet:?xt=urn:btih:{HASH}&dn=Some+Name")).unwrap();
        assert_eq!(
            d.job_id().unwrap().as_str(),
            "0123456789abcdef0123456789abcdef01234567"
        );
        assert_eq!(d.display_name().as_deref(), Some("Some Name"));
    }

    #[test]
    fn base32_btih_is_accepted() {
        let d = Descriptor::magnet("magnet:?xt=urn:btih:ABCDEFGHIJKLMNOPQRSTUVWXYZ234567").unwrap();
        assert_eq!(
            d.job_id().unwrap().as_str(),
            "abcdefghijklmnopqrstuvwxyz234567"
        );
        assert!(d.display_name().is_none());
    }

    #[test]
    fn malformed_magnets_are_rejected() {
        for uri in [
            "",
            "invalid-magnet",
            "magnet:?dn=x",
            "magnet:?xt=urn:btih:zz",
            "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef0123456g",
            "http://example.com/?xt=urn:btih:0123456789abcdef0123456789abcdef01234567",
        ] {
            let err = Descriptor::magnet(uri).unwrap_err();
            assert!(
                matches!(err, Error::InvalidDescriptor { .. }),
                "{uri:?} -> {err}"
            );
        }
    }

    #[test]
    fn descriptor_file_identity_is_content_hash() {
        let a = Descriptor::file("a.torrent", b"d4:infod4:name1:aee".to_vec()).unwrap();
        let b = Descriptor::file("renamed.torrent", b"d4:infod4:name1:aee".to_vec()).unwrap();
        assert_eq!(a.job_id().unwrap(), b.job_id().unwrap());
        assert_eq!(a.job_id().unwrap().as_str().len(), 40);
        assert_eq!(a.display_name().as_deref(), Some("a"));
    }

    #[test]
    fn descriptor_file_and_magnet_are_keyed_separately() {
        let bytes = b"d4:infod4:name1:aee".to_vec();
        let file = Descriptor::file("a.torrent", bytes.clone()).unwrap();
        let id = file.job_id().unwrap();
        assert_eq!(id.as_str(), &blake3::hash(&bytes).to_hex()[..40]);

        let magnet = Descriptor::magnet(format!("magnet:?xt=urn:btih:{HASH}")).unwrap();
        assert_ne!(magnet.job_id().unwrap(), id);
    }

    #[test]
    fn descriptor_file_validation() {
        assert!(Descriptor::file("test.txt", b"x".to_vec()).is_err());
        assert!(Descriptor::file("test.torrent", Vec::new()).is_err());
    }

    #[test]
    fn percent_decoding_handles_escapes_and_stray_percent() {
        assert_eq!(percent_decode("a%20b"), "a b");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("x%zzy"), "x%zzy");
    }
}
