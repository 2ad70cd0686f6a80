use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The lookup families served by the aggregator. Each one gets its own pipeline.
pub enum ResourceKind {
    /// Numeric price per country code.
    Pricing,
    /// Status string per tracking number.
    Track,
    /// Product list per shipment order number.
    Shipments,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [Self::Pricing, Self::Track, Self::Shipments];

    /// Name used both in logs and as the `/aggregation` query parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pricing => "pricing",
            Self::Track => "track",
            Self::Shipments => "shipments",
        }
    }

    /// Path of the downstream batch endpoint, relative to the services host.
    pub fn downstream_path(self) -> &'static str {
        match self {
            Self::Pricing => "/pricing",
            Self::Track => "/track",
            Self::Shipments => "/shipments",
        }
    }

    /// Query parameter carrying the comma-joined keys on the downstream call.
    pub fn downstream_query_param(self) -> &'static str {
        "q"
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_paths_line_up() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.downstream_path(), format!("/{kind}"));
            assert_eq!(kind.downstream_query_param(), "q");
        }
    }
}
