mod router;
mod stats;

pub use router::admin_router;
