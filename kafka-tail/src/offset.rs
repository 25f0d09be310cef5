//! Turns a configured offset specifier into a concrete starting offset.

use std::str::FromStr;

use tracing::debug;

use crate::broker::BrokerClient;
use crate::error::OffsetError;
use crate::types::{OFFSET_NEWEST, OFFSET_OLDEST};

/// Parsed form of an offset specifier: `"oldest"`, `"newest"` or a signed integer.
///
/// Integers `>= -2` are passed through verbatim, which covers the two sentinels.
/// Anything below `-2` means "start `|n|` messages back from the newest offset".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSpec {
    Oldest,
    Newest,
    Absolute(i64),
    Lookback(i64),
}

impl FromStr for OffsetSpec {
    type Err = OffsetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oldest" => Ok(OffsetSpec::Oldest),
            "newest" => Ok(OffsetSpec::Newest),
            _ => match s.parse::<i64>() {
                Ok(n) if n >= OFFSET_OLDEST => Ok(OffsetSpec::Absolute(n)),
                Ok(n) => Ok(OffsetSpec::Lookback(n)),
                Err(_) => Err(OffsetError::InvalidOffsetSpecifier(s.to_string())),
            },
        }
    }
}

impl OffsetSpec {
    /// Only `Lookback` talks to the broker: one query for the oldest offset, one for
    /// the newest. A lookback reaching past retained history clamps to the oldest.
    pub async fn resolve<B>(
        self,
        topic: &str,
        partition: i32,
        client: &B,
    ) -> Result<i64, OffsetError>
    where
        B: BrokerClient + ?Sized,
    {
        match self {
            OffsetSpec::Oldest => Ok(OFFSET_OLDEST),
            OffsetSpec::Newest => Ok(OFFSET_NEWEST),
            OffsetSpec::Absolute(n) => Ok(n),
            OffsetSpec::Lookback(n) => {
                let oldest = client
                    .get_offset(topic, partition, OFFSET_OLDEST)
                    .await
                    .map_err(|source| OffsetError::Broker {
                        which: "oldest",
                        source,
                    })?;
                let newest = client
                    .get_offset(topic, partition, OFFSET_NEWEST)
                    .await
                    .map_err(|source| OffsetError::Broker {
                        which: "newest",
                        source,
                    })?;

                let target = newest.saturating_add(n);
                debug!(
                    topic,
                    partition, oldest, newest, lookback = n, "Resolved lookback offset"
                );
                if target < oldest {
                    Ok(oldest)
                } else {
                    Ok(target)
                }
            }
        }
    }
}

pub async fn resolve_offset<B>(
    specifier: &str,
    topic: &str,
    partition: i32,
    client: &B,
) -> Result<i64, OffsetError>
where
    B: BrokerClient + ?Sized,
{
    specifier
        .parse::<OffsetSpec>()?
        .resolve(topic, partition, client)
        .await
}
