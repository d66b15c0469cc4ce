//! External metadata lookup for SparrowFlix.
//!
//! Pure HTTP client over TMDB, plus the [`MetadataLookup`] seam the
//! conversation workflows depend on.

mod error;
mod lookup;
mod tmdb;
mod types;

pub use error::{MetadataError, Result};
pub use lookup::MetadataLookup;
pub use tmdb::{TMDB_DEFAULT_BASE_URL, TmdbClient};
pub use types::{Candidate, SeasonOutline, TitleDetails};
