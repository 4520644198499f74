use std::fs::create_dir_all;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::{Duration, Instant};

use ipnetwork::Ipv4Network;
use redb::{Database, ReadableTable, TableDefinition, TableError};

use crate::{Error, Result};

/// One bucket per subnet; keys are dotted quads, values a single byte.
pub const DEFAULT_DB_PATH: &str = "/var/run/microbox/ipam.redb";

const OPEN_TIMEOUT: Duration = Duration::from_secs(2);
const OPEN_RETRY: Duration = Duration::from_millis(50);

/// A reserved address inside a subnet, held until released.
#[derive(Clone, Debug)]
pub struct IpamLease {
    pub subnet: Ipv4Network,
    pub addr: Ipv4Addr,
}

/// Persistent address allocator. The database is opened per operation so
/// concurrent launchers serialize on short transactions instead of
/// holding the file for the sandbox lifetime.
#[derive(Clone, Debug)]
pub struct Ipam {
    db_path: PathBuf,
}

impl Ipam {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// Picks the first free address above the network address, skipping
    /// the reserved set, and records it in a single write transaction.
    pub fn acquire(&self, subnet: Ipv4Network, reserved: &[Ipv4Addr]) -> Result<IpamLease> {
        let db = self.open()?;
        let bucket = subnet.to_string();
        let table_def = TableDefinition::<&str, u8>::new(&bucket);
        let txn = db
            .begin_write()
            .map_err(|v| Error::IpamFailed(format!("ipam transaction failed: {v}")))?;
        let addr;
        {
            let mut table = txn
                .open_table(table_def)
                .map_err(|v| Error::IpamFailed(format!("ipam table failed: {v}")))?;
            addr = Self::pick(subnet, reserved, &table)?;
            table
                .insert(addr.to_string().as_str(), 1u8)
                .map_err(|v| Error::IpamFailed(format!("ipam insert failed: {v}")))?;
        }
        txn.commit()
            .map_err(|v| Error::IpamFailed(format!("ipam commit failed: {v}")))?;
        Ok(IpamLease { subnet, addr })
    }

    /// Deletes the lease entry. Releasing twice is a no-op.
    pub fn release(&self, lease: &IpamLease) -> Result<()> {
        let db = self.open()?;
        let bucket = lease.subnet.to_string();
        let table_def = TableDefinition::<&str, u8>::new(&bucket);
        let txn = db
            .begin_write()
            .map_err(|v| Error::IpamFailed(format!("ipam transaction failed: {v}")))?;
        {
            let mut table = match txn.open_table(table_def) {
                Ok(v) => v,
                // No bucket means nothing was ever leased from it.
                Err(TableError::TableDoesNotExist(_)) => return Ok(()),
                Err(v) => {
                    return Err(Error::IpamFailed(format!("ipam table failed: {v}")));
                }
            };
            table
                .remove(lease.addr.to_string().as_str())
                .map_err(|v| Error::IpamFailed(format!("ipam remove failed: {v}")))?;
        }
        txn.commit()
            .map_err(|v| Error::IpamFailed(format!("ipam commit failed: {v}")))?;
        Ok(())
    }

    fn pick(
        subnet: Ipv4Network,
        reserved: &[Ipv4Addr],
        table: &impl ReadableTable<&'static str, u8>,
    ) -> Result<Ipv4Addr> {
        for addr in subnet.iter() {
            if addr == subnet.network() || addr == subnet.broadcast() {
                continue;
            }
            if reserved.contains(&addr) {
                continue;
            }
            let taken = table
                .get(addr.to_string().as_str())
                .map_err(|v| Error::IpamFailed(format!("ipam lookup failed: {v}")))?
                .is_some();
            if !taken {
                return Ok(addr);
            }
        }
        Err(Error::IpamExhausted {
            subnet: subnet.to_string(),
        })
    }

    /// Another launcher may hold the file lock; retry briefly before
    /// reporting the database as busy.
    fn open(&self) -> Result<Database> {
        if let Some(parent) = self.db_path.parent() {
            create_dir_all(parent)?;
        }
        let deadline = Instant::now() + OPEN_TIMEOUT;
        loop {
            match Database::create(&self.db_path) {
                Ok(db) => return Ok(db),
                Err(_) if Instant::now() < deadline => sleep(OPEN_RETRY),
                Err(_) => {
                    return Err(Error::IpamBusy {
                        db: self.db_path.clone(),
                    });
                }
            }
        }
    }
}
