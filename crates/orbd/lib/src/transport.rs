//! Boundary to the transport layer that carries object requests.

use async_trait::async_trait;
use orbd_proto::{Redirect, RequestId};

/// Receives the redirect resolved for a misrouted request.
///
/// Implemented by the transport; the manager calls it from
/// [`ActivationManager::forward_misrouted`](crate::ActivationManager::forward_misrouted).
#[async_trait]
pub trait RedirectSink: Send + Sync {
	/// Reissues request `request_id` against `redirect`.
	async fn deliver_redirect(&self, request_id: RequestId, redirect: Redirect);
}
