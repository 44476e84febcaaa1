//! Live topology: data model, instance sessions, probes and quorum evaluation

pub mod gtid;
pub mod instance;
pub mod model;
pub mod probe;
pub mod quorum;
pub mod session;

pub use gtid::GtidSet;
pub use instance::Instance;
pub use model::{
    ClusterRecord, ClusterRole, ClusterRoleRecord, ClusterSetRecord, ExitStateAction,
    InstanceOptions, InstanceRecord, InstanceRole, MemberState, TopologyMode, CLUSTERSET_CHANNEL,
};
pub use probe::{MemberProbe, ProbeOutcome, ProbeResult};
pub use quorum::{ClusterHealth, ClusterStatus, MemberClassification, MemberHealth, QuorumEvaluator};
pub use session::{Row, Session, SessionProvider, Statement, SystemVariable};
