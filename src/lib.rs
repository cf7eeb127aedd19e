pub mod cache;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod errors;
pub mod footprint;
pub mod ingestion;
pub mod job;
pub mod output;
pub mod providers;
pub mod resolver;
pub mod telemetry;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use cache::{GeocodeCache, MemoryGeocodeCache, SqliteGeocodeCache};
pub use config::AppConfig;
pub use coordinator::{BatchJobCoordinator, CoordinatorSettings};
pub use errors::{AppError, AppResult};
pub use footprint::{FootprintGenerator, Polygon};
pub use ingestion::{NormalizedAddress, RawAddress, VenueRecord};
pub use job::{JobId, JobSnapshot, JobStatus, RecordError, RecordErrorKind};
pub use output::{Feature, FeatureCollectionWriter, OutputRef};
pub use providers::{Coordinate, GeocodeProvider, ProviderFailure, ProviderKind};
pub use resolver::{GeocodeResolver, ResolveError, ResolverSettings};

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,venue_footprints=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
