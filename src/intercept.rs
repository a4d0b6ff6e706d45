use std::sync::{Arc, RwLock};

use crate::http::Message;
use crate::http::parse::Side;

/// A user-supplied transform over a parsed message head. Interceptors run
/// synchronously on the forwarding path and must not block; they may mutate
/// headers, method/URL, status, or the upgrade flag in place. Keeping framing
/// headers consistent with any body change is the interceptor's job.
pub type Interceptor = Arc<dyn Fn(&mut Message) + Send + Sync>;

/// Two append-only interceptor chains, one per direction. Registration order
/// is evaluation order; a registration racing an in-flight message may or may
/// not apply to it, but applies to every message framed afterwards.
#[derive(Default)]
pub struct Pipeline {
	request: RwLock<Vec<Interceptor>>,
	response: RwLock<Vec<Interceptor>>,
}

impl Pipeline {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_request(&self, interceptor: Interceptor) {
		self
			.request
			.write()
			.expect("mutex acquired")
			.push(interceptor);
	}

	pub fn add_response(&self, interceptor: Interceptor) {
		self
			.response
			.write()
			.expect("mutex acquired")
			.push(interceptor);
	}

	pub fn apply(&self, side: Side, msg: &mut Message) {
		let chain = match side {
			Side::Request => &self.request,
			Side::Response => &self.response,
		};
		// Snapshot under the lock, run outside it: user code never executes
		// inside our critical section.
		let chain: Vec<Interceptor> = chain.read().expect("mutex acquired").clone();
		for interceptor in &chain {
			interceptor(msg);
		}
	}

	pub fn request_len(&self) -> usize {
		self.request.read().expect("mutex acquired").len()
	}

	pub fn response_len(&self) -> usize {
		self.response.read().expect("mutex acquired").len()
	}
}

impl std::fmt::Debug for Pipeline {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Pipeline")
			.field("request", &self.request_len())
			.field("response", &self.response_len())
			.finish()
	}
}
