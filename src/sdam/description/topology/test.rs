use std::{collections::HashMap, time::Duration};

use pretty_assertions::assert_eq;

use super::{choose_n, TopologyDescription, TopologyType};
use crate::{
    bson::{doc, oid::ObjectId, DateTime},
    client::session::ClusterTime,
    hello::{HelloCommandResponse, HelloReply, LastWrite},
    options::{ClientOptions, ServerAddress},
    sdam::description::server::{ServerDescription, ServerType},
    selection_criteria::{ReadPreference, ReadPreferenceOptions, SelectionCriteria, TagSet},
};

fn addr(host: &str) -> ServerAddress {
    ServerAddress::parse(host).unwrap()
}

struct HelloBuilder {
    response: HelloCommandResponse,
    rtt: Duration,
}

impl HelloBuilder {
    fn new() -> Self {
        Self {
            response: HelloCommandResponse {
                min_wire_version: Some(6),
                max_wire_version: Some(9),
                logical_session_timeout_minutes: Some(30),
                max_bson_object_size: Some(16 * 1024 * 1024),
                ..Default::default()
            },
            rtt: Duration::from_millis(10),
        }
    }

    fn standalone(mut self) -> Self {
        self.response.is_writable_primary = Some(true);
        self
    }

    fn mongos(mut self) -> Self {
        self.response.is_writable_primary = Some(true);
        self.response.msg = Some("isdbgrid".to_string());
        self
    }

    fn primary(mut self, set_name: &str, hosts: &[&str]) -> Self {
        self.response.is_writable_primary = Some(true);
        self.response.set_name = Some(set_name.to_string());
        self.response.hosts = Some(hosts.iter().map(|h| h.to_string()).collect());
        self
    }

    fn secondary(mut self, set_name: &str, hosts: &[&str]) -> Self {
        self.response.secondary = Some(true);
        self.response.set_name = Some(set_name.to_string());
        self.response.hosts = Some(hosts.iter().map(|h| h.to_string()).collect());
        self
    }

    fn election(mut self, set_version: i32, election_id: ObjectId) -> Self {
        self.response.set_version = Some(set_version);
        self.response.election_id = Some(election_id);
        self
    }

    fn designated_primary(mut self, host: &str) -> Self {
        self.response.primary = Some(host.to_string());
        self
    }

    fn last_write(mut self, date: DateTime) -> Self {
        self.response.last_write = Some(LastWrite {
            last_write_date: date,
            op_time: None,
        });
        self
    }

    fn tags(mut self, tags: &[(&str, &str)]) -> Self {
        self.response.tags = Some(
            tags.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }

    fn session_timeout_minutes(mut self, minutes: Option<i64>) -> Self {
        self.response.logical_session_timeout_minutes = minutes;
        self
    }

    fn rtt(mut self, rtt: Duration) -> Self {
        self.rtt = rtt;
        self
    }

    fn into_description(self, host: &str) -> ServerDescription {
        let address = addr(host);
        let reply = HelloReply {
            server_address: address.clone(),
            command_response: self.response,
            cluster_time: None,
        };
        ServerDescription::new_from_hello_reply(address, reply, self.rtt)
    }
}

fn rs_topology(seeds: &[&str]) -> TopologyDescription {
    let mut description = TopologyDescription::default();
    description.initialize(
        &ClientOptions::builder()
            .hosts(seeds.iter().map(|s| addr(s)).collect::<Vec<_>>())
            .repl_set_name("rs".to_string())
            .build(),
    );
    description
}

fn primary_count(description: &TopologyDescription) -> usize {
    description
        .servers
        .values()
        .filter(|s| s.server_type == ServerType::RsPrimary)
        .count()
}

fn assert_primary_invariant(description: &TopologyDescription) {
    let primaries = primary_count(description);
    assert!(primaries <= 1, "found {} primaries", primaries);
    if matches!(
        description.topology_type,
        TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary
    ) {
        assert_eq!(
            description.topology_type,
            if primaries == 1 {
                TopologyType::ReplicaSetWithPrimary
            } else {
                TopologyType::ReplicaSetNoPrimary
            }
        );
    }
}

#[test]
fn primary_discovers_members() {
    let mut topology = rs_topology(&["h1:27017"]);
    assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);

    topology
        .update(
            HelloBuilder::new()
                .primary("rs", &["h1:27017", "h2:27017", "h3:27017"])
                .into_description("h1:27017"),
        )
        .unwrap();

    assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert_eq!(topology.servers.len(), 3);
    assert!(topology.servers.contains_key(&addr("h2:27017")));
    assert!(topology.servers.contains_key(&addr("h3:27017")));
    assert_primary_invariant(&topology);
}

#[test]
fn new_primary_demotes_old_primary() {
    let hosts = &["h1:27017", "h2:27017"];
    let mut topology = rs_topology(hosts);

    let first_election = ObjectId::new();
    let second_election = ObjectId::new();

    topology
        .update(
            HelloBuilder::new()
                .primary("rs", hosts)
                .election(1, first_election)
                .into_description("h1:27017"),
        )
        .unwrap();
    assert_primary_invariant(&topology);

    topology
        .update(
            HelloBuilder::new()
                .primary("rs", hosts)
                .election(2, second_election)
                .into_description("h2:27017"),
        )
        .unwrap();

    assert_primary_invariant(&topology);
    assert_eq!(
        topology.servers.get(&addr("h1:27017")).unwrap().server_type,
        ServerType::Unknown
    );
    assert_eq!(
        topology.servers.get(&addr("h2:27017")).unwrap().server_type,
        ServerType::RsPrimary
    );

    // A belated claim from the stale primary must not usurp the newer election.
    topology
        .update(
            HelloBuilder::new()
                .primary("rs", hosts)
                .election(1, first_election)
                .into_description("h1:27017"),
        )
        .unwrap();

    assert_primary_invariant(&topology);
    assert_eq!(
        topology.servers.get(&addr("h1:27017")).unwrap().server_type,
        ServerType::Unknown
    );
    assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
}

#[test]
fn primary_loss_transitions_to_no_primary() {
    let hosts = &["h1:27017", "h2:27017"];
    let mut topology = rs_topology(hosts);

    topology
        .update(HelloBuilder::new().primary("rs", hosts).into_description("h1:27017"))
        .unwrap();
    assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);

    // The primary's check fails; its description becomes Unknown.
    topology
        .update(ServerDescription::new_from_error(
            addr("h1:27017"),
            crate::error::Error::network_timeout(),
        ))
        .unwrap();

    assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);
    assert_primary_invariant(&topology);
}

#[test]
fn wrong_set_name_removes_member() {
    let hosts = &["h1:27017", "h2:27017"];
    let mut topology = rs_topology(hosts);

    topology
        .update(
            HelloBuilder::new()
                .secondary("other_set", hosts)
                .into_description("h2:27017"),
        )
        .unwrap();

    assert!(!topology.servers.contains_key(&addr("h2:27017")));
}

#[test]
fn sharded_topology_removes_non_mongos() {
    let mut topology = TopologyDescription::default();
    topology.initialize(
        &ClientOptions::builder()
            .hosts(vec![addr("s1:27017"), addr("s2:27017")])
            .build(),
    );
    assert_eq!(topology.topology_type, TopologyType::Unknown);

    topology
        .update(HelloBuilder::new().mongos().into_description("s1:27017"))
        .unwrap();
    assert_eq!(topology.topology_type, TopologyType::Sharded);

    topology
        .update(
            HelloBuilder::new()
                .secondary("rs", &["s2:27017"])
                .into_description("s2:27017"),
        )
        .unwrap();
    assert!(!topology.servers.contains_key(&addr("s2:27017")));
}

#[test]
fn single_seed_defaults_to_direct() {
    let mut topology = TopologyDescription::default();
    topology.initialize(
        &ClientOptions::builder()
            .hosts(vec![addr("localhost:27017")])
            .build(),
    );
    assert_eq!(topology.topology_type, TopologyType::Direct);

    // A standalone hello keeps the single-server topology as-is.
    topology
        .update(HelloBuilder::new().standalone().into_description("localhost:27017"))
        .unwrap();
    assert_eq!(topology.topology_type, TopologyType::Direct);
    assert_eq!(topology.servers.len(), 1);
}

#[test]
fn single_seed_with_discovery_becomes_single() {
    let mut topology = TopologyDescription::default();
    topology.initialize(
        &ClientOptions::builder()
            .hosts(vec![addr("localhost:27017")])
            .direct_connection(false)
            .build(),
    );
    assert_eq!(topology.topology_type, TopologyType::Unknown);

    topology
        .update(HelloBuilder::new().standalone().into_description("localhost:27017"))
        .unwrap();
    assert_eq!(topology.topology_type, TopologyType::Single);
}

#[test]
fn secondary_designates_possible_primary() {
    let hosts = &["h1:27017", "h2:27017"];
    let mut topology = rs_topology(hosts);

    topology
        .update(
            HelloBuilder::new()
                .secondary("rs", hosts)
                .designated_primary("h2:27017")
                .into_description("h1:27017"),
        )
        .unwrap();

    assert_eq!(
        topology.servers.get(&addr("h2:27017")).unwrap().server_type,
        ServerType::PossiblePrimary
    );
    // A possible primary is not yet a primary.
    assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);
}

#[test]
fn logical_session_timeout_is_minimum_of_data_bearing_members() {
    let hosts = &["h1:27017", "h2:27017"];
    let mut topology = rs_topology(hosts);

    topology
        .update(
            HelloBuilder::new()
                .primary("rs", hosts)
                .session_timeout_minutes(Some(30))
                .into_description("h1:27017"),
        )
        .unwrap();
    topology
        .update(
            HelloBuilder::new()
                .secondary("rs", hosts)
                .session_timeout_minutes(Some(20))
                .into_description("h2:27017"),
        )
        .unwrap();

    assert_eq!(
        topology.logical_session_timeout,
        Some(Duration::from_secs(20 * 60))
    );

    // A data-bearing member without session support disables sessions topology-wide.
    topology
        .update(
            HelloBuilder::new()
                .secondary("rs", hosts)
                .session_timeout_minutes(None)
                .into_description("h2:27017"),
        )
        .unwrap();
    assert_eq!(topology.logical_session_timeout, None);
}

#[test]
fn cluster_time_only_advances() {
    let mut topology = TopologyDescription::default();

    let time = |t: u32| ClusterTime {
        cluster_time: crate::bson::Timestamp { time: t, increment: 0 },
        signature: doc! {},
    };

    topology.advance_cluster_time(&time(10));
    assert_eq!(topology.cluster_time, Some(time(10)));

    topology.advance_cluster_time(&time(5));
    assert_eq!(topology.cluster_time, Some(time(10)));

    topology.advance_cluster_time(&time(11));
    assert_eq!(topology.cluster_time, Some(time(11)));
}

mod selection {
    use super::*;
    use pretty_assertions::assert_eq;

    fn nearest() -> SelectionCriteria {
        SelectionCriteria::ReadPreference(ReadPreference::Nearest { options: None })
    }

    fn secondary_with_options(options: ReadPreferenceOptions) -> SelectionCriteria {
        SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: Some(options),
        })
    }

    /// An RS topology with one primary and two secondaries at the given RTTs, all having
    /// written at the given times.
    fn rtt_topology(
        rtts: &[(&str, u64, bool)],
        last_writes: &[(&str, i64)],
        local_threshold: Option<Duration>,
        heartbeat_freq: Option<Duration>,
    ) -> TopologyDescription {
        let hosts: Vec<&str> = rtts.iter().map(|(h, _, _)| *h).collect();
        let options = ClientOptions::builder()
            .hosts(hosts.iter().map(|h| addr(h)).collect::<Vec<_>>())
            .repl_set_name("rs".to_string())
            .local_threshold(local_threshold)
            .heartbeat_freq(heartbeat_freq)
            .build();
        let mut topology = TopologyDescription::default();
        topology.initialize(&options);

        let writes: HashMap<&str, i64> = last_writes.iter().cloned().collect();
        for (host, rtt_ms, is_primary) in rtts {
            let mut builder = HelloBuilder::new().rtt(Duration::from_millis(*rtt_ms));
            builder = if *is_primary {
                builder.primary("rs", &hosts)
            } else {
                builder.secondary("rs", &hosts)
            };
            if let Some(millis) = writes.get(host) {
                builder = builder.last_write(DateTime::from_millis(*millis));
            }
            topology.update(builder.into_description(host)).unwrap();
        }
        topology
    }

    #[test]
    fn latency_window_excludes_distant_servers() {
        let topology = rtt_topology(
            &[("h1:27017", 5, true), ("h2:27017", 20, false), ("h3:27017", 200, false)],
            &[],
            Some(Duration::from_millis(15)),
            None,
        );

        let eligible = topology
            .suitable_servers_in_latency_window(&nearest())
            .unwrap();
        let mut addresses: Vec<String> =
            eligible.iter().map(|s| s.address.to_string()).collect();
        addresses.sort();

        assert_eq!(addresses, vec!["h1:27017", "h2:27017"]);

        // Every pair in the window is within the local threshold of each other.
        let threshold = Duration::from_millis(15);
        for a in eligible.iter() {
            for b in eligible.iter() {
                let (rtt_a, rtt_b) = (
                    a.average_round_trip_time.unwrap(),
                    b.average_round_trip_time.unwrap(),
                );
                let gap = if rtt_a > rtt_b { rtt_a - rtt_b } else { rtt_b - rtt_a };
                assert!(gap <= threshold);
            }
        }
    }

    #[test]
    fn selection_within_window_is_uniform() {
        const TRIALS: usize = 10_000;

        let candidates = vec!["a", "b", "c", "d"];
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for _ in 0..TRIALS {
            let picked = choose_n(&candidates, 1).next().unwrap();
            *counts.entry(picked).or_default() += 1;
        }

        // Chi-squared test against the uniform distribution; 3 degrees of freedom, with the
        // threshold set well past the 99.9% quantile (16.27) to keep flakiness negligible.
        let expected = TRIALS as f64 / candidates.len() as f64;
        let chi_squared: f64 = candidates
            .iter()
            .map(|c| {
                let observed = *counts.get(c).unwrap_or(&0) as f64;
                (observed - expected).powi(2) / expected
            })
            .sum();

        assert!(
            chi_squared < 25.0,
            "selection skewed from uniform: chi^2 = {}, counts = {:?}",
            chi_squared,
            counts
        );
    }

    #[test]
    fn max_staleness_filters_lagging_secondary() {
        // Primary wrote at T, secondary at T-120s; with a 10s heartbeat the secondary's lag
        // is 130s, over a 60s limit.
        let t = 1_600_000_000_000_i64;
        let topology = rtt_topology(
            &[("h1:27017", 5, true), ("h2:27017", 5, false)],
            &[("h1:27017", t), ("h2:27017", t - 120_000)],
            None,
            Some(Duration::from_secs(10)),
        );

        let eligible = topology
            .suitable_servers_in_latency_window(&secondary_with_options(
                ReadPreferenceOptions::builder()
                    .max_staleness(Some(Duration::from_secs(60)))
                    .build(),
            ))
            .unwrap();
        assert!(eligible.is_empty());

        // A limit that accommodates the lag admits the secondary.
        let eligible = topology
            .suitable_servers_in_latency_window(&secondary_with_options(
                ReadPreferenceOptions::builder()
                    .max_staleness(Some(Duration::from_secs(200)))
                    .build(),
            ))
            .unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].address, addr("h2:27017"));
    }

    #[test]
    fn increasing_max_staleness_never_shrinks_the_eligible_set() {
        let t = 1_600_000_000_000_i64;
        let topology = rtt_topology(
            &[
                ("h1:27017", 5, true),
                ("h2:27017", 5, false),
                ("h3:27017", 5, false),
                ("h4:27017", 5, false),
            ],
            &[
                ("h1:27017", t),
                ("h2:27017", t - 30_000),
                ("h3:27017", t - 90_000),
                ("h4:27017", t - 300_000),
            ],
            None,
            Some(Duration::from_secs(10)),
        );

        let eligible_at = |staleness: Duration| -> Vec<String> {
            let mut out: Vec<String> = topology
                .suitable_servers_in_latency_window(&secondary_with_options(
                    ReadPreferenceOptions::builder().max_staleness(Some(staleness)).build(),
                ))
                .unwrap()
                .iter()
                .map(|s| s.address.to_string())
                .collect();
            out.sort();
            out
        };

        let mut previous = Vec::new();
        for staleness_secs in [20, 50, 110, 320, 1000] {
            let current = eligible_at(Duration::from_secs(staleness_secs));
            assert!(
                previous.iter().all(|addr| current.contains(addr)),
                "at {}s the eligible set {:?} lost servers from {:?}",
                staleness_secs,
                current,
                previous
            );
            previous = current;
        }
        assert_eq!(previous.len(), 3);
    }

    #[test]
    fn too_small_max_staleness_is_rejected() {
        let topology = rtt_topology(
            &[("h1:27017", 5, true), ("h2:27017", 5, false)],
            &[],
            None,
            Some(Duration::from_secs(10)),
        );

        // The floor is heartbeat frequency (10s) plus the idle write period (10s).
        let result = topology.suitable_servers_in_latency_window(&secondary_with_options(
            ReadPreferenceOptions::builder()
                .max_staleness(Some(Duration::from_secs(15)))
                .build(),
        ));
        assert!(result.is_err());
    }

    #[test]
    fn first_matching_tag_set_wins() {
        let hosts = &["h1:27017", "h2:27017", "h3:27017"];
        let mut topology = rs_topology(hosts);
        topology
            .update(
                HelloBuilder::new()
                    .primary("rs", hosts)
                    .tags(&[("dc", "ny")])
                    .into_description("h1:27017"),
            )
            .unwrap();
        topology
            .update(
                HelloBuilder::new()
                    .secondary("rs", hosts)
                    .tags(&[("dc", "ny"), ("rack", "1")])
                    .into_description("h2:27017"),
            )
            .unwrap();
        topology
            .update(
                HelloBuilder::new()
                    .secondary("rs", hosts)
                    .tags(&[("dc", "sf")])
                    .into_description("h3:27017"),
            )
            .unwrap();

        let tag_set = |pairs: &[(&str, &str)]| -> TagSet {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };

        // The first tag set matches nothing; the second selects the sf secondary.
        let eligible = topology
            .suitable_servers_in_latency_window(&secondary_with_options(
                ReadPreferenceOptions::builder()
                    .tag_sets(Some(vec![
                        tag_set(&[("dc", "tokyo")]),
                        tag_set(&[("dc", "sf")]),
                    ]))
                    .build(),
            ))
            .unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].address, addr("h3:27017"));

        // No tag set matching any secondary yields an empty result.
        let eligible = topology
            .suitable_servers_in_latency_window(&secondary_with_options(
                ReadPreferenceOptions::builder()
                    .tag_sets(Some(vec![tag_set(&[("dc", "tokyo")])]))
                    .build(),
            ))
            .unwrap();
        assert!(eligible.is_empty());
    }

    #[test]
    fn primary_mode_selects_only_the_primary() {
        let topology = rtt_topology(
            &[("h1:27017", 5, true), ("h2:27017", 5, false)],
            &[],
            None,
            None,
        );

        let eligible = topology
            .suitable_servers_in_latency_window(&SelectionCriteria::ReadPreference(
                ReadPreference::Primary,
            ))
            .unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].address, addr("h1:27017"));
    }

    #[test]
    fn direct_topologies_ignore_read_preference_mode() {
        let mut topology = TopologyDescription::default();
        topology.initialize(
            &ClientOptions::builder()
                .hosts(vec![addr("localhost:27017")])
                .build(),
        );
        topology
            .update(HelloBuilder::new().standalone().into_description("localhost:27017"))
            .unwrap();

        let eligible = topology
            .suitable_servers_in_latency_window(&secondary_with_options(Default::default()))
            .unwrap();
        assert_eq!(eligible.len(), 1);
    }
}
