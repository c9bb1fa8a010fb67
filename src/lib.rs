pub mod error;
pub mod model;
pub mod simulator;

pub use error::EpiError;
pub use model::compartment::{CompartmentName, CompartmentStore, StratumTag, STRATUM_MARKER};
pub use model::config::{linspace, BirthApproach, FlowRequest, ModelConfig, OutputConnection};
pub use model::flow::{Flow, FlowCategory, FlowKind, FlowRegistry};
pub use model::parameter::{ParameterName, ParameterStore, ResolvedParameter, TimeVariant};
pub use model::stratify::{Adjustment, Strata, StratificationRecord, StratificationRequest};
pub use model::{ModelBuilder, StratifiedModel};
pub use simulator::ode::{Bdf, Rk4, SolverSettings};
pub use simulator::tracker::{DerivedOutput, TrackedQuantities};
pub use simulator::{Integrator, ModelResults, OdeSystem, Trajectory};

pub mod prelude {
    pub mod model {
        pub use crate::model::{
            compartment::{CompartmentName, StratumTag},
            config::{linspace, BirthApproach, FlowRequest, ModelConfig, OutputConnection},
            flow::{FlowCategory, FlowKind},
            parameter::{ParameterName, TimeVariant},
            stratify::{Adjustment, Strata, StratificationRequest, AGE},
            ModelBuilder, StratifiedModel, CRUDE_BIRTH_RATE, ENTRY_FRACTION,
            UNIVERSAL_DEATH_RATE,
        };
    }
    pub mod simulator {
        pub use crate::simulator::{
            ode::{Bdf, Rk4, SolverSettings},
            rhs::ModelRhs,
            tracker::{DerivedOutput, TrackedQuantities, Tracker},
            Integrator, ModelResults, OdeSystem, TrackedSystem, Trajectory,
        };
    }

    pub use crate::error::EpiError;
    pub use crate::prelude::model::*;
    pub use crate::prelude::simulator::*;

    /// Build an [`Adjustment`] from `stratum => value` pairs
    ///
    /// ```ignore
    /// let recovery = adjustment!("low" => 0.7, "high" => 0.5);
    /// ```
    #[macro_export]
    macro_rules! adjustment {
        ($($stratum:expr => $value:expr),* $(,)?) => {{
            let adjustment = $crate::Adjustment::new();
            $(
                let adjustment = adjustment.value($stratum, $value);
            )*
            adjustment
        }};
    }
}
