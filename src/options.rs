//! Contains all of the types needed to specify options to the driver's methods.

pub use crate::{
    client::options::{
        Acknowledgment,
        AuthMechanism,
        ClientOptions,
        Compressor,
        Credential,
        ReadConcern,
        ReadConcernLevel,
        ServerAddress,
        SessionOptions,
        TransactionOptions,
        WriteConcern,
    },
    selection_criteria::{
        Predicate,
        ReadPreference,
        ReadPreferenceOptions,
        SelectionCriteria,
        TagSet,
    },
};
