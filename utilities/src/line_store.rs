//! Append-only, line-oriented, pipe-delimited stores.
//!
//! Each store is a single file. Appends take the writer lock and flush
//! before returning; state transitions are read-modify-write rewrites that
//! land via an atomic rename so a crash never leaves a half-written store.
//! Every mutation is mirrored into the store's audit journal.

use std::{
	fs::{self, OpenOptions},
	io::Write,
	path::{Path, PathBuf},
	sync::RwLock,
};

use anyhow::{Context, Result};

use crate::audit::AuditLog;

/// Whether `field` may be stored as one column of a line record. The
/// format reserves `|` and line breaks; a field carrying them would shift
/// columns on the next read. Every surface that feeds a store checks its
/// caller-supplied fields with this before writing.
pub fn is_clean_field(field: &str) -> bool {
	!field.contains(['|', '\n', '\r'])
}

pub struct LineStore {
	path: PathBuf,
	lock: RwLock<()>,
	audit: AuditLog,
}

impl LineStore {
	/// Opens (creating lazily, directories included) `<dir>/<name>.dat` and
	/// its audit journal.
	pub fn open(dir: &Path, name: &str) -> Result<Self> {
		fs::create_dir_all(dir)
			.with_context(|| format!("Could not create store directory {}", dir.display()))?;
		let path = dir.join(format!("{name}.dat"));
		// Touch the file so a fresh deployment starts from an empty store.
		OpenOptions::new()
			.create(true)
			.append(true)
			.open(&path)
			.with_context(|| format!("Could not open store {}", path.display()))?;
		let audit = AuditLog::open(dir, name)?;
		Ok(Self { path, lock: RwLock::new(()), audit })
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Appends one record line. `key` identifies the record in the audit
	/// journal.
	pub fn append(&self, key: &str, line: &str) -> Result<()> {
		let _guard = self.lock.write().expect("store lock poisoned");
		let mut file = OpenOptions::new()
			.append(true)
			.open(&self.path)
			.with_context(|| format!("Could not open store {} for append", self.path.display()))?;
		file.write_all(line.as_bytes())
			.and_then(|()| file.write_all(b"\n"))
			.and_then(|()| file.flush())
			.with_context(|| format!("Could not append to store {}", self.path.display()))?;
		self.audit.record("APPEND", key, line);
		Ok(())
	}

	/// Reads every record line. Readers proceed concurrently.
	pub fn read_all(&self) -> Result<Vec<String>> {
		let _guard = self.lock.read().expect("store lock poisoned");
		let contents = fs::read_to_string(&self.path)
			.with_context(|| format!("Could not read store {}", self.path.display()))?;
		Ok(contents.lines().map(str::to_owned).collect())
	}

	/// Rewrites the store under the writer lock: `f` maps each existing
	/// line to its replacement, or to `None` to drop it. The rewrite lands
	/// atomically. Returns the number of lines `f` changed or dropped.
	pub fn rewrite(
		&self,
		operation: &str,
		key: &str,
		mut f: impl FnMut(&str) -> Option<String>,
	) -> Result<usize> {
		let _guard = self.lock.write().expect("store lock poisoned");
		let contents = fs::read_to_string(&self.path)
			.with_context(|| format!("Could not read store {}", self.path.display()))?;

		let mut changed = 0;
		let mut out = String::with_capacity(contents.len());
		for line in contents.lines() {
			match f(line) {
				Some(replacement) => {
					if replacement != line {
						changed += 1;
					}
					out.push_str(&replacement);
					out.push('\n');
				},
				None => changed += 1,
			}
		}

		let tmp = self.path.with_extension("dat.tmp");
		fs::write(&tmp, out.as_bytes())
			.with_context(|| format!("Could not write {}", tmp.display()))?;
		fs::rename(&tmp, &self.path)
			.with_context(|| format!("Could not replace store {}", self.path.display()))?;

		self.audit.record(operation, key, &format!("lines_changed={changed}"));
		Ok(changed)
	}
}
