use serde::{Deserialize, Serialize};

/// What to do when a user, collection or index is already present.
#[derive(clap::ValueEnum, Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExistingPolicy {
    /// Treat "already exists" as success and converge to the declared state.
    #[default]
    Reconcile,
    /// Abort on the first object that already exists.
    Fail,
}

impl std::fmt::Display for ExistingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExistingPolicy::Reconcile => write!(f, "reconcile"),
            ExistingPolicy::Fail => write!(f, "fail"),
        }
    }
}

/// Sort direction of one field in an index key pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_i32(self) -> i32 {
        match self {
            Direction::Ascending => 1,
            Direction::Descending => -1,
        }
    }

    /// Read a direction back from a key pattern value returned by the server.
    /// The server may hand back any numeric type, so all of them are accepted.
    pub fn from_bson(value: &mongodb::bson::Bson) -> Option<Self> {
        use mongodb::bson::Bson;
        let n = match value {
            Bson::Int32(n) => *n as f64,
            Bson::Int64(n) => *n as f64,
            Bson::Double(n) => *n,
            _ => return None,
        };
        if n > 0.0 {
            Some(Direction::Ascending)
        } else if n < 0.0 {
            Some(Direction::Descending)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}
