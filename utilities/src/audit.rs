//! Per-store audit journal.
//!
//! One line per mutation: `SCOPE|ISO8601|OPERATION|key|detail`.

use std::{
	fs::{self, File, OpenOptions},
	io::Write,
	path::{Path, PathBuf},
	sync::Mutex,
};

use anyhow::{Context, Result};
use vf_primitives::format_timestamp;

pub struct AuditLog {
	scope: String,
	path: PathBuf,
	file: Mutex<File>,
}

impl AuditLog {
	/// Opens (creating if absent) `<dir>/<scope>.audit.log`.
	pub fn open(dir: &Path, scope: &str) -> Result<Self> {
		fs::create_dir_all(dir)
			.with_context(|| format!("Could not create audit directory {}", dir.display()))?;
		let path = dir.join(format!("{scope}.audit.log"));
		let file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(&path)
			.with_context(|| format!("Could not open audit journal {}", path.display()))?;
		Ok(Self { scope: scope.to_uppercase(), path, file: Mutex::new(file) })
	}

	/// Appends one audit line. Failures are logged and swallowed: the audit
	/// journal must never take the guarded operation down with it.
	pub fn record(&self, operation: &str, key: &str, detail: &str) {
		let line = format!(
			"{}|{}|{}|{}|{}\n",
			self.scope,
			format_timestamp(chrono::Local::now().naive_local()),
			operation,
			key,
			detail
		);
		let mut file = self.file.lock().expect("audit journal lock poisoned");
		if let Err(error) = file.write_all(line.as_bytes()).and_then(|()| file.flush()) {
			tracing::warn!(
				path = %self.path.display(),
				%error,
				"failed to append to audit journal"
			);
		}
	}
}
