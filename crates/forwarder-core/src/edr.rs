//! Append-only sink for [`Edr`] records, grounded on the richest `edr_logger`
//! variant of the design's source contract: one line per record, file opened
//! once and held open for the process lifetime.

use std::{
	fs::{File, OpenOptions},
	io::Write,
	path::Path,
	sync::Mutex,
};

use crate::types::Edr;

/// Writes [`Edr`] records to an append-only file, one per line. Constructed
/// with [`EdrSink::disabled`] when no `edr_log` path is configured, in which
/// case [`EdrSink::record`] is a no-op.
pub struct EdrSink {
	file: Option<Mutex<File>>,
}

impl EdrSink {
	/// No EDR path configured: emission is a no-op.
	pub fn disabled() -> Self {
		Self { file: None }
	}

	pub fn open(path: &Path) -> std::io::Result<Self> {
		let file = OpenOptions::new().create(true).append(true).open(path)?;
		Ok(Self { file: Some(Mutex::new(file)) })
	}

	/// Appends one line for `edr`. Logged and dropped on write failure; an
	/// EDR sink is a side channel, never worth failing a transaction over.
	pub fn record(&self, edr: &Edr) {
		let Some(file) = &self.file else { return };
		let mut file = file.lock().unwrap();
		if let Err(source) = writeln!(file, "{edr}") {
			crate::warn!("failed to append EDR record: {source}");
		}
	}
}
