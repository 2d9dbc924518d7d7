//! Full-disk encryption: secrets, LUKS tooling, recovery key parsing and the
//! enrollment state machine.

pub mod enrollment;
pub mod luks;
pub mod recovery;
pub mod secret;

pub use enrollment::{Degradation, EncryptionPhase, EncryptionState, EnrollmentManager};
pub use recovery::RecoveryCredential;
pub use secret::{BootstrapSecret, SecretFile};
