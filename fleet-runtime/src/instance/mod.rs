pub mod lifecycle;
pub mod provisioner;
pub mod record;
pub mod state_machine;

pub use lifecycle::LifecycleController;
pub use provisioner::{OpenOutcome, PaymentAttestation, ProviderCredential, Provisioner};
pub use record::{InstanceRecord, InstanceRepository, Plan};
pub use state_machine::InstanceState;
