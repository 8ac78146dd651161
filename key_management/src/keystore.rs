// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use lantern_chain::{Group, GroupToml, Node};
use lantern_crypto::{PrivateKey, PublicPoly, Share};
use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::Zeroize;

use crate::errors::Error;

const KEY_DIR: &str = "key";
const GROUP_DIR: &str = "groups";
const DB_DIR: &str = "db";
const IDENTITY_FILE: &str = "identity.json";

/// A node's long-term identity: the dialable address bound to a BLS
/// keypair by a self-signature.
pub struct IdentityPair {
    pub address: String,
    pub key: PrivateKey,
}

impl IdentityPair {
    pub fn generate<R: rand::RngCore>(address: String, rng: &mut R) -> Self {
        IdentityPair {
            address,
            key: PrivateKey::generate(rng),
        }
    }

    /// The roster entry this identity corresponds to.
    pub fn node(&self, index: u32) -> Node {
        let public = self.key.public_key();
        let digest = Node::identity_digest(&self.address, &public);
        Node {
            index,
            address: self.address.clone(),
            key: public,
            signature: self.key.sign(&digest).to_bytes().to_vec(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    address: String,
    public_key: String,
    private_key: String,
}

#[derive(Serialize, Deserialize)]
struct ShareFile {
    beacon_id: String,
    epoch: u64,
    index: u32,
    secret: String,
    public_poly: String,
}

/// The per-node base directory: `key/` for private material, `groups/` for
/// one sealed file per epoch, `db/` for the chain stores.
pub struct FileStore {
    base: PathBuf,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(base: P) -> Result<Self, Error> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(base.join(KEY_DIR))?;
        fs::create_dir_all(base.join(GROUP_DIR))?;
        fs::create_dir_all(base.join(DB_DIR))?;
        restrict_dir(&base.join(KEY_DIR))?;
        Ok(FileStore { base })
    }

    pub fn db_dir(&self) -> PathBuf {
        self.base.join(DB_DIR)
    }

    // --- identity -------------------------------------------------------

    pub fn save_identity(&self, pair: &IdentityPair) -> Result<(), Error> {
        let mut secret = hex::encode(pair.key.to_bytes());
        let file = IdentityFile {
            address: pair.address.clone(),
            public_key: hex::encode(pair.key.public_key().to_bytes()),
            private_key: secret.clone(),
        };
        let path = self.base.join(KEY_DIR).join(IDENTITY_FILE);
        write_private_json(&path, &file)?;
        secret.zeroize();
        Ok(())
    }

    pub fn load_identity(&self) -> Result<Option<IdentityPair>, Error> {
        let path = self.base.join(KEY_DIR).join(IDENTITY_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        check_private(&path);
        let parsed: IdentityFile = serde_json::from_reader(BufReader::new(file))?;
        let mut secret_bytes = hex::decode(&parsed.private_key)?;
        let key = PrivateKey::from_bytes(&secret_bytes)?;
        secret_bytes.zeroize();
        if hex::encode(key.public_key().to_bytes()) != parsed.public_key {
            return Err(Error::Malformed(
                "identity public key does not match the private key".into(),
            ));
        }
        Ok(Some(IdentityPair {
            address: parsed.address,
            key,
        }))
    }

    // --- distributed key shares ----------------------------------------

    /// Persist the share produced by a completed ceremony. One file per
    /// epoch; the previous epoch's file is removed once the owner has
    /// transitioned.
    pub fn save_share(
        &self,
        beacon_id: &str,
        epoch: u64,
        share: &Share,
        public_poly: &PublicPoly,
    ) -> Result<(), Error> {
        let mut secret = hex::encode(share.secret_bytes());
        let file = ShareFile {
            beacon_id: beacon_id.to_owned(),
            epoch,
            index: share.index(),
            secret: secret.clone(),
            public_poly: hex::encode(public_poly.to_bytes()),
        };
        write_private_json(&self.share_path(beacon_id, epoch), &file)?;
        secret.zeroize();
        Ok(())
    }

    pub fn load_share(
        &self,
        beacon_id: &str,
        epoch: u64,
    ) -> Result<Option<(Share, PublicPoly)>, Error> {
        let path = self.share_path(beacon_id, epoch);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        check_private(&path);
        let parsed: ShareFile = serde_json::from_reader(BufReader::new(file))?;
        let mut secret_bytes = hex::decode(&parsed.secret)?;
        let share = Share::from_bytes(parsed.index, &secret_bytes)?;
        secret_bytes.zeroize();
        let public_poly = PublicPoly::from_bytes(&hex::decode(&parsed.public_poly)?)?;
        if public_poly.eval(share.index())? != share.public_key() {
            return Err(Error::InconsistentShare);
        }
        Ok(Some((share, public_poly)))
    }

    /// Destroy a rotated-out share file.
    pub fn delete_share(&self, beacon_id: &str, epoch: u64) -> Result<(), Error> {
        match fs::remove_file(self.share_path(beacon_id, epoch)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn share_path(&self, beacon_id: &str, epoch: u64) -> PathBuf {
        self.base
            .join(KEY_DIR)
            .join(format!("{beacon_id}-share-epoch-{epoch}.json"))
    }

    // --- group files ----------------------------------------------------

    pub fn save_group(&self, group: &Group) -> Result<(), Error> {
        let text = toml::to_string_pretty(&GroupToml::from(group))
            .map_err(|e| Error::Malformed(e.to_string()))?;
        let path = self.group_path(&group.beacon_id, group.epoch);
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(text.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load_group(&self, beacon_id: &str, epoch: u64) -> Result<Group, Error> {
        let path = self.group_path(beacon_id, epoch);
        let text = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NoSuchEpoch(epoch)
            } else {
                e.into()
            }
        })?;
        let parsed: GroupToml =
            toml::from_str(&text).map_err(|e| Error::Malformed(e.to_string()))?;
        Group::try_from(parsed).map_err(|e| Error::Malformed(e.to_string()))
    }

    /// The highest epoch with a group file on disk, if any.
    pub fn latest_group(&self, beacon_id: &str) -> Result<Option<Group>, Error> {
        let prefix = format!("{beacon_id}-epoch-");
        let mut best: Option<u64> = None;
        for entry in fs::read_dir(self.base.join(GROUP_DIR))? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix(&prefix) {
                if let Some(epoch) = rest
                    .strip_suffix(".toml")
                    .and_then(|e| e.parse::<u64>().ok())
                {
                    best = Some(best.map_or(epoch, |b: u64| b.max(epoch)));
                }
            }
        }
        match best {
            Some(epoch) => Ok(Some(self.load_group(beacon_id, epoch)?)),
            None => Ok(None),
        }
    }

    fn group_path(&self, beacon_id: &str, epoch: u64) -> PathBuf {
        self.base
            .join(GROUP_DIR)
            .join(format!("{beacon_id}-epoch-{epoch}.toml"))
    }
}

/// Serialize to a file only the owner can read.
fn write_private_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = BufWriter::new(options.open(path)?);
    serde_json::to_writer_pretty(&mut file, value)?;
    file.flush()?;
    Ok(())
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> Result<(), Error> {
    Ok(())
}

/// Warn when private material has been loosened on disk.
fn check_private(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = fs::metadata(path) {
            let mode = meta.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                warn!(
                    path = %path.display(),
                    mode = format!("{mode:o}"),
                    "private key material is readable by other users"
                );
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}
