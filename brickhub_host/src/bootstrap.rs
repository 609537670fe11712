//! Side-channel daemon bootstrap. When no EV3 transport is reachable the
//! link kills any stale daemon on the brick and starts a fresh one
//! detached, then retries the transports. The SSH machinery itself is an
//! external collaborator; this is the seam the link consumes.

use futures::future::BoxFuture;

pub trait DaemonBootstrap: Send + Sync {
    /// Kill a stale daemon process on the brick, if any. Idempotent.
    fn kill_stale_daemon(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Start the daemon detached so it outlives the bootstrap channel.
    fn start_daemon_detached(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}
