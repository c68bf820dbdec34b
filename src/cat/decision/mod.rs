pub mod agent;
pub mod allocation;
pub mod network;
pub mod replay;

pub use agent::{
    AgentSnapshot, ItemSelectionAgent, ScoringMode, Selection, SnapshotError, TrainReport,
    AGENT_STATE_VERSION,
};
pub use allocation::allocate_categories;
pub use network::ValueNetwork;
pub use replay::{Experience, ReplayBuffer};
