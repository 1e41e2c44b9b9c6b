use std::time::Duration;

use crate::proto;

/// Caps applied to a single relayed connection.
///
/// A zero value on either axis disables that axis, i.e. the connection is
/// unbounded in bytes and/or wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Limit {
    /// Total bytes forwarded across both directions before the circuit is
    /// closed. Zero disables the cap.
    pub data: u64,
    /// Wall-clock budget of the circuit. Zero disables the timer.
    pub duration: Duration,
}

impl Limit {
    /// No cap on either axis.
    pub const UNLIMITED: Limit = Limit {
        data: 0,
        duration: Duration::ZERO,
    };

    pub fn is_unlimited(&self) -> bool {
        self.data == 0 && self.duration.is_zero()
    }

    /// The tighter of two limits, per axis. Zero counts as infinity.
    pub fn min(self, other: Limit) -> Limit {
        fn tighter<T: Ord + Default + Copy>(a: T, b: T) -> T {
            match (a == T::default(), b == T::default()) {
                (true, _) => b,
                (_, true) => a,
                _ => a.min(b),
            }
        }

        Limit {
            data: tighter(self.data, other.data),
            duration: tighter(self.duration, other.duration),
        }
    }

    pub(crate) fn to_proto(self) -> proto::Limit {
        proto::Limit {
            duration: Some(self.duration.as_secs() as u32),
            data: Some(self.data),
        }
    }

    pub(crate) fn from_proto(limit: Option<proto::Limit>) -> Limit {
        let limit = limit.unwrap_or_default();
        Limit {
            data: limit.data.unwrap_or(0),
            duration: Duration::from_secs(u64::from(limit.duration.unwrap_or(0))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_treats_zero_as_infinity() {
        let bounded = Limit {
            data: 1 << 17,
            duration: Duration::from_secs(120),
        };

        assert_eq!(Limit::UNLIMITED.min(bounded), bounded);
        assert_eq!(bounded.min(Limit::UNLIMITED), bounded);
        assert_eq!(Limit::UNLIMITED.min(Limit::UNLIMITED), Limit::UNLIMITED);
    }

    #[test]
    fn min_takes_the_tighter_axis_independently() {
        let a = Limit {
            data: 100,
            duration: Duration::from_secs(300),
        };
        let b = Limit {
            data: 500,
            duration: Duration::from_secs(60),
        };

        assert_eq!(
            a.min(b),
            Limit {
                data: 100,
                duration: Duration::from_secs(60),
            }
        );
    }

    #[test]
    fn proto_roundtrip_maps_absent_to_zero() {
        assert_eq!(Limit::from_proto(None), Limit::UNLIMITED);

        let limit = Limit {
            data: 42,
            duration: Duration::from_secs(7),
        };
        assert_eq!(Limit::from_proto(Some(limit.to_proto())), limit);
    }
}
