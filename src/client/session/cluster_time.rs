use serde::{Deserialize, Serialize};

use crate::bson::{Document, Timestamp};

/// Struct modeling a cluster time reported by the server.
///
/// See [the MongoDB documentation](https://www.mongodb.com/docs/manual/core/read-isolation-consistency-recency/)
/// for more information.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTime {
    pub(crate) cluster_time: Timestamp,

    pub(crate) signature: Document,
}

impl std::cmp::Ord for ClusterTime {
    fn cmp(&self, other: &ClusterTime) -> std::cmp::Ordering {
        let lhs = (self.cluster_time.time, self.cluster_time.increment);
        let rhs = (other.cluster_time.time, other.cluster_time.increment);
        lhs.cmp(&rhs)
    }
}

impl std::cmp::PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &ClusterTime) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// The signature is the server's business; two cluster times with the same timestamp are
// interchangeable as far as gossip ordering is concerned.
impl std::cmp::PartialEq for ClusterTime {
    fn eq(&self, other: &ClusterTime) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl std::cmp::Eq for ClusterTime {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::doc;

    pub(crate) fn cluster_time(time: u32, increment: u32) -> ClusterTime {
        ClusterTime {
            cluster_time: Timestamp { time, increment },
            signature: doc! { "keyId": 0_i64 },
        }
    }

    #[test]
    fn ordering_ignores_signature() {
        let earlier = cluster_time(100, 1);
        let mut later = cluster_time(100, 2);
        later.signature = doc! { "keyId": 42_i64 };

        assert!(earlier < later);
        assert_eq!(earlier, cluster_time(100, 1));
        assert_ne!(earlier, later);
    }
}
