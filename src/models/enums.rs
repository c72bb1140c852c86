use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(VerdictKind {
    Clean => "clean",
    Flagged => "flagged",
    Escalate => "escalate",
});

str_enum!(DispatchStatus {
    NotRequired => "not_required",
    Pending => "pending",
    Delivered => "delivered",
    Failed => "failed",
});

str_enum!(AttemptOutcome {
    Delivered => "delivered",
    Failed => "failed",
});

impl VerdictKind {
    /// Flagged and Escalate verdicts are pushed to the alert webhook.
    pub fn requires_dispatch(&self) -> bool {
        matches!(self, Self::Flagged | Self::Escalate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn verdict_kind_round_trips_through_str() {
        for kind in [VerdictKind::Clean, VerdictKind::Flagged, VerdictKind::Escalate] {
            assert_eq!(VerdictKind::from_str(kind.as_str()).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_value_is_invalid_enum() {
        let err = DispatchStatus::from_str("sent").unwrap_err();
        match err {
            DatabaseError::InvalidEnum { field, value } => {
                assert_eq!(field, "DispatchStatus");
                assert_eq!(value, "sent");
            }
            other => panic!("Expected InvalidEnum, got: {other}"),
        }
    }

    #[test]
    fn only_flagged_and_escalate_dispatch() {
        assert!(!VerdictKind::Clean.requires_dispatch());
        assert!(VerdictKind::Flagged.requires_dispatch());
        assert!(VerdictKind::Escalate.requires_dispatch());
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&DispatchStatus::NotRequired).unwrap();
        assert_eq!(json, "\"not_required\"");
    }
}
