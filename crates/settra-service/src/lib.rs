//! # Settra Service
//!
//! The decision layer between the store and the HTTP surface:
//! - the versioned declaration state machine
//!   (`created | uptodate | upgraded | outdated | rejected | mismatch`)
//! - the query engine (context filters, rule matching, registry-ordered
//!   output)
//! - cache stamps (ETags derived from the store's mutation stamp)
//! - the periodic health sentinel

pub mod declare;
pub mod etag;
pub mod health;
pub mod query;

pub use declare::{
    DeclarationInput, DeclarationOutcome, DeclareError, DiffLevel, Difference, declare,
};
pub use etag::state_etag;
pub use health::{HealthMonitor, HealthSample};
pub use query::{
    ContextFilter, FeatureFilter, FilterError, MatchedRule, QueryError, QueryOutput, QueryRequest,
    SettingResults, query_rules, query_rules_since,
};
