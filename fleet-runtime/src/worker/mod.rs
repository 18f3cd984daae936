pub mod registry;
pub mod transport;

pub use registry::{Worker, WorkerProvisioner, WorkerRegistry, WorkerStatus};
pub use transport::{ExecOutput, SshTransport, WorkerTransport};
