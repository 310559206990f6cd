// Library interface for the stealth sidecar.
// Binaries and integration tests reach the defense engine and the attack model through here.

pub mod error;
pub mod config;
pub mod subnet;
pub mod attestation;
pub mod epoch;
pub mod juggler;
pub mod proof;
pub mod relay;
pub mod network;
pub mod memnet;
pub mod defense;
pub mod rainbow;
pub mod traffic;
pub mod metrics;

pub use error::{DefenseError, DefenseResult};
pub use subnet::{Backbone, BackboneAssignment, ModuloBackbone, SubnetId, SubnetSet, SUBNET_COUNT};
pub use attestation::{Attestation, MessageDigest};
pub use epoch::{Epoch, EpochClock, EpochInfo, ManualClock, SystemClock, TimeSource};
pub use juggler::{JugglerState, ReshuffleReport, SubnetJuggler};
pub use proof::{Identity, LocalNullifierProver, NullifierLog, ProofProvider, RateLimitedProofIssuer, RelayProof};
pub use relay::{FriendNode, FriendRelay, RelayEnvelope, RelayInbox, RelayOutcome, SkipReason};
pub use network::GossipNetwork;
pub use memnet::MemoryNetwork;
pub use defense::{DefenseOrchestrator, DefenseStatus};
pub use rainbow::{ArrivalEvent, AttackConfig, AttackReport, AttackSimulator, ReportComparison};
pub use metrics::MetricsSink;
