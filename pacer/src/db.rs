use std::collections::BTreeMap;

use crate::{error::DbError, operation::Operation};

/// Adapter for the system under test.
///
/// `execute` is called concurrently from every worker thread and may block, the
/// driver dedicates an OS thread to each worker. Returning an error, or panicking,
/// records the operation as failed; it never stops the run.
pub trait Db: Send + Sync + 'static {
    /// Called once before the workload starts with the configured properties.
    fn init(&mut self, _properties: &BTreeMap<String, String>) -> Result<(), DbError> {
        Ok(())
    }

    /// Runs one operation and returns its result code, `0` meaning success.
    fn execute(&self, operation: &Operation) -> Result<i32, DbError>;

    /// Called once after every worker has stopped.
    fn cleanup(&self) -> Result<(), DbError> {
        Ok(())
    }
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::{thread, time::Duration};

    use super::*;

    /// Adapter that only sleeps, for dry runs of the driver itself.
    ///
    /// The sleep can be overridden through the `dummy.sleep_ms` property.
    #[derive(Debug, Clone, Default)]
    pub struct DummyDb {
        pub sleep: Duration,
    }

    impl DummyDb {
        pub const SLEEP_PROPERTY: &'static str = "dummy.sleep_ms";

        pub fn new(sleep: Duration) -> Self {
            Self { sleep }
        }
    }

    impl Db for DummyDb {
        fn init(&mut self, properties: &BTreeMap<String, String>) -> Result<(), DbError> {
            if let Some(raw) = properties.get(Self::SLEEP_PROPERTY) {
                let ms = raw.parse::<u64>().map_err(|e| {
                    DbError::new(format!("invalid {}={raw:?}: {e}", Self::SLEEP_PROPERTY))
                })?;
                self.sleep = Duration::from_millis(ms);
            }
            tracing::debug!("DummyDb sleeps {:?} per operation", self.sleep);
            Ok(())
        }

        fn execute(&self, _operation: &Operation) -> Result<i32, DbError> {
            if !self.sleep.is_zero() {
                thread::sleep(self.sleep);
            }
            Ok(0)
        }
    }

}
