use std::time::Duration;

pub(crate) const DEFAULT_THREAD_COUNT: u8 = 4;

pub(crate) const DEFAULT_THREAD_STACK_SIZE: usize = 16 * 1024 * 1024;

pub(crate) const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) const DEFAULT_RPC_RETRY_COUNT: usize = 3;

pub(crate) const DEFAULT_RPC_RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(20);

pub(crate) const DEFAULT_DB_FILE: &str = "federator.sqlite3";
