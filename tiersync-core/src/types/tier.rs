use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The four fixed-frequency sync workflows, ordered from most to least
/// frequent.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum Tier {
    HotListings = 1,
    DailySync = 2,
    WeeklyDeep = 3,
    MonthlyRefresh = 4,
}

impl Tier {
    pub const ALL: [Tier; 4] = [
        Tier::HotListings,
        Tier::DailySync,
        Tier::WeeklyDeep,
        Tier::MonthlyRefresh,
    ];

    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Tier::HotListings),
            2 => Some(Tier::DailySync),
            3 => Some(Tier::WeeklyDeep),
            4 => Some(Tier::MonthlyRefresh),
            _ => None,
        }
    }

    pub fn default_name(self) -> &'static str {
        match self {
            Tier::HotListings => "hot_listings",
            Tier::DailySync => "daily_sync",
            Tier::WeeklyDeep => "weekly_deep",
            Tier::MonthlyRefresh => "monthly_refresh",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> Self {
        tier.level()
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Tier::from_level(value)
            .ok_or_else(|| format!("tier level must be 1-4, got {value}"))
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(level) = trimmed.parse::<u8>() {
            return Tier::try_from(level);
        }
        Tier::ALL
            .into_iter()
            .find(|tier| tier.default_name() == trimmed)
            .ok_or_else(|| format!("unknown tier '{trimmed}'"))
    }
}
