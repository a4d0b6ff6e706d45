use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::strng::Strng;

/// A live client connection as the tracker sees it: the virtual host it is
/// charged to and the signal that forces its relay task to tear down.
#[derive(Debug)]
struct Registration {
	host: Strng,
	close: CancellationToken,
}

#[derive(Debug, Default)]
struct Inner {
	next_id: u64,
	by_id: HashMap<u64, Registration>,
	by_host: HashMap<Strng, HashSet<u64>>,
}

/// Process-wide registry of live client connections, indexed flat by ID and
/// grouped by virtual host. Both indices mutate together under one lock, so
/// any observer sees them mutually consistent: an ID is present iff it is in
/// exactly one host set.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
	inner: Mutex<Inner>,
}

impl ConnectionTracker {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a connection under `host`, returning its process-unique ID.
	pub fn add(&self, host: Strng, close: CancellationToken) -> u64 {
		let mut inner = self.inner.lock().expect("mutex acquired");
		let id = inner.next_id;
		inner.next_id += 1;
		inner.by_id.insert(id, Registration {
			host: host.clone(),
			close,
		});
		inner.by_host.entry(host.clone()).or_default().insert(id);
		debug!(id, %host, "connection tracked");
		id
	}

	/// Remove a connection from both indices. Idempotent: teardown fires from
	/// several paths and only the first does anything.
	pub fn remove(&self, id: u64) {
		let mut inner = self.inner.lock().expect("mutex acquired");
		let Some(reg) = inner.by_id.remove(&id) else {
			return;
		};
		if let Some(ids) = inner.by_host.get_mut(&reg.host) {
			ids.remove(&id);
			if ids.is_empty() {
				inner.by_host.remove(&reg.host);
			}
		}
		debug!(id, host = %reg.host, "connection untracked");
	}

	/// Signal close to every connection charged to `host`; returns how many
	/// were signaled. Entries leave the tracker when their relay tasks tear
	/// down, not here.
	pub fn close_host(&self, host: &str) -> usize {
		let inner = self.inner.lock().expect("mutex acquired");
		let Some(ids) = inner.by_host.get(host) else {
			return 0;
		};
		let mut closed = 0;
		for id in ids {
			if let Some(reg) = inner.by_id.get(id) {
				reg.close.cancel();
				closed += 1;
			}
		}
		debug!(host, closed, "bulk disconnect");
		closed
	}

	/// Signal close to every tracked connection; returns how many.
	pub fn close_all(&self) -> usize {
		let inner = self.inner.lock().expect("mutex acquired");
		for reg in inner.by_id.values() {
			reg.close.cancel();
		}
		let closed = inner.by_id.len();
		debug!(closed, "bulk disconnect (all hosts)");
		closed
	}

	pub fn len(&self) -> usize {
		self.inner.lock().expect("mutex acquired").by_id.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Snapshot of live connection counts per virtual host.
	pub fn hosts(&self) -> Vec<(Strng, usize)> {
		let inner = self.inner.lock().expect("mutex acquired");
		inner
			.by_host
			.iter()
			.map(|(host, ids)| (host.clone(), ids.len()))
			.collect()
	}

	#[cfg(test)]
	fn assert_consistent(&self) {
		let inner = self.inner.lock().expect("mutex acquired");
		let flat: HashSet<u64> = inner.by_id.keys().copied().collect();
		let mut grouped = HashSet::new();
		for (host, ids) in &inner.by_host {
			assert!(!ids.is_empty(), "empty host set retained for {host}");
			for id in ids {
				assert!(grouped.insert(*id), "{id} appears under multiple hosts");
				assert_eq!(
					inner.by_id.get(id).map(|r| &r.host),
					Some(host),
					"{id} charged to the wrong host"
				);
			}
		}
		assert_eq!(flat, grouped, "flat and per-host indices disagree");
	}
}
