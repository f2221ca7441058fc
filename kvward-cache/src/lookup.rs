//! Outcome of a cache read.

/// What a cache read found and where the value came from.
///
/// Callers that only care about the value use [`into_option`](Self::into_option);
/// the variants keep the distinction between a confirmed absence
/// ([`NegativeHit`](Self::NegativeHit)) and a plain miss visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup<T> {
    /// Served from a live cache entry.
    Hit(T),
    /// Not cached; fetched through the loader and written back.
    Loaded(T),
    /// Served from a logically expired entry. A rebuild may be in flight.
    Stale(T),
    /// The cache holds the empty sentinel: the record is known not to exist.
    NegativeHit,
    /// No value anywhere the read looked.
    Miss,
}

impl<T> CacheLookup<T> {
    /// The value, regardless of provenance.
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Hit(v) | Self::Loaded(v) | Self::Stale(v) => Some(v),
            Self::NegativeHit | Self::Miss => None,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Hit(v) | Self::Loaded(v) | Self::Stale(v) => Some(v),
            Self::NegativeHit | Self::Miss => None,
        }
    }

    /// Returns true if a value was produced.
    pub fn is_found(&self) -> bool {
        self.value().is_some()
    }

    /// Returns true if the answer came from the cache without touching the
    /// durable store.
    pub fn was_cache_hit(&self) -> bool {
        matches!(self, Self::Hit(_) | Self::Stale(_) | Self::NegativeHit)
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheLookup<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Self::Hit(v) => CacheLookup::Hit(f(v)),
            Self::Loaded(v) => CacheLookup::Loaded(f(v)),
            Self::Stale(v) => CacheLookup::Stale(f(v)),
            Self::NegativeHit => CacheLookup::NegativeHit,
            Self::Miss => CacheLookup::Miss,
        }
    }
}
