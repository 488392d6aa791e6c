//! Tests for the topology planner
//!
//! Covers action selection per rack, global ordering, in-flight deferral,
//! the rack-update concurrency cap and the data-ownership gate on
//! scale-downs and rack removal.

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::super::planner::*;
    use super::super::topology::{
        NodeHealth, NodeObservation, ObservedRack, Topology, WorkloadObservation,
    };
    use crate::crd::{
        CassandraClusterSpec, Datacenter, DesiredRack, Rack, RackKey, Topology as SpecTopology,
    };

    fn spec(racks: &[(&str, &str, i32)]) -> CassandraClusterSpec {
        let mut dcs: Vec<Datacenter> = Vec::new();
        for (dc, rack, replicas) in racks {
            let rack = Rack {
                name: rack.to_string(),
                nodes_per_racks: Some(*replicas),
                ..Default::default()
            };
            match dcs.iter_mut().find(|d| d.name == *dc) {
                Some(existing) => existing.rack.push(rack),
                None => dcs.push(Datacenter {
                    name: dc.to_string(),
                    rack: vec![rack],
                    ..Default::default()
                }),
            }
        }
        CassandraClusterSpec {
            topology: SpecTopology { dc: dcs },
            ..Default::default()
        }
    }

    fn node(name: &str, ordinal: u32, owns_data: Option<bool>) -> NodeObservation {
        NodeObservation {
            name: name.to_string(),
            ordinal,
            ready: true,
            health: NodeHealth::Up,
            owns_data,
            trigger: None,
        }
    }

    /// Observed rack that matches `desired` except for the replica count
    fn observed_like(desired: &DesiredRack, replicas: i32) -> ObservedRack {
        ObservedRack {
            workload: Some(WorkloadObservation {
                name: format!("demo-{}", desired.key),
                replicas,
                image: Some(desired.image.clone()),
                config_hash: Some(desired.config_hash.clone()),
                settled: true,
            }),
            nodes: (0..replicas.max(0) as u32)
                .map(|i| node(&format!("demo-{}-{}", desired.key, i), i, None))
                .collect(),
        }
    }

    fn key(dc: &str, rack: &str) -> RackKey {
        RackKey::new(dc, rack)
    }

    fn limits(n: usize) -> PlanLimits {
        PlanLimits {
            max_concurrent_rack_updates: n,
        }
    }

    #[test]
    fn test_empty_observed_adds_rack() {
        let desired = spec(&[("dc1", "rack1", 3)]).desired_racks();
        let plan = plan(&desired, &Topology::default(), &BTreeSet::new(), limits(1)).unwrap();

        assert_eq!(
            plan.actions,
            vec![Action::AddRack {
                rack: key("dc1", "rack1"),
                replicas: 3
            }]
        );
    }

    #[test]
    fn test_scale_up_deferred_while_other_rack_updating() {
        let desired = spec(&[("dc1", "rack1", 5), ("dc1", "rack2", 3)]).desired_racks();
        let mut observed = Topology::default();
        observed
            .racks
            .insert(key("dc1", "rack1"), observed_like(&desired[0], 3));
        observed
            .racks
            .insert(key("dc1", "rack2"), observed_like(&desired[1], 2));

        let in_flight = BTreeSet::from([key("dc1", "rack2")]);
        let plan = plan(&desired, &observed, &in_flight, limits(1)).unwrap();

        assert!(plan.actions.is_empty());
        assert!(plan.deferred.contains(&Deferral {
            rack: key("dc1", "rack1"),
            reason: DeferReason::ConcurrencyLimit,
        }));
        assert!(plan.deferred.contains(&Deferral {
            rack: key("dc1", "rack2"),
            reason: DeferReason::InFlight,
        }));

        // Once rack2 settles, rack1 scales
        let plan = super::super::planner::plan(&desired, &observed, &BTreeSet::new(), limits(1))
            .unwrap();
        assert_eq!(
            plan.actions[0],
            Action::ScaleRack {
                rack: key("dc1", "rack1"),
                from: 3,
                to: 5
            }
        );
    }

    #[test]
    fn test_one_action_per_rack_with_priority() {
        let mut s = spec(&[("dc1", "rack1", 3)]);
        s.cassandra_image = "cassandra:4.1.3".to_string();
        let desired = s.desired_racks();

        let mut observed_rack = observed_like(&desired[0], 2);
        if let Some(w) = observed_rack.workload.as_mut() {
            w.image = Some("cassandra:3.11.10".to_string());
            w.config_hash = Some("stale".to_string());
        }
        let mut observed = Topology::default();
        observed.racks.insert(key("dc1", "rack1"), observed_rack);

        let plan = plan(&desired, &observed, &BTreeSet::new(), limits(5)).unwrap();
        assert_eq!(plan.actions.len(), 1);
        assert!(matches!(plan.actions[0], Action::ScaleRack { to: 3, .. }));
    }

    #[test]
    fn test_global_order_and_tie_break() {
        let mut s = spec(&[
            ("dc2", "rack1", 1),
            ("dc1", "rack2", 1),
            ("dc1", "rack1", 3),
            ("dc1", "rack3", 4),
        ]);
        s.cassandra_image = "cassandra:4.1.3".to_string();
        let desired = s.desired_racks();
        let by_key = |k: &RackKey| desired.iter().find(|d| &d.key == k).unwrap();

        let mut observed = Topology::default();
        // dc1-rack1: scale down 5 -> 3, ordinals 3 and 4 already drained
        let mut shrinking = observed_like(by_key(&key("dc1", "rack1")), 5);
        shrinking.nodes[3].owns_data = Some(false);
        shrinking.nodes[4].owns_data = Some(false);
        observed.racks.insert(key("dc1", "rack1"), shrinking);
        // dc1-rack3: scale up 2 -> 4
        observed
            .racks
            .insert(key("dc1", "rack3"), observed_like(by_key(&key("dc1", "rack3")), 2));
        // dc2-rack1: image change
        let mut image_rack = observed_like(by_key(&key("dc2", "rack1")), 1);
        image_rack.workload.as_mut().unwrap().image = Some("cassandra:3.11.10".to_string());
        observed.racks.insert(key("dc2", "rack1"), image_rack);
        // dc1-rack2 missing -> AddRack

        let plan = plan(&desired, &observed, &BTreeSet::new(), limits(10)).unwrap();
        let names: Vec<String> = plan.actions.iter().map(|a| a.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "AddRack(dc1-rack2, replicas=1)",
                "ScaleRack(dc1-rack3, replicas=4)",
                "UpdateImage(dc2-rack1, image=cassandra:4.1.3)",
                "ScaleRack(dc1-rack1, replicas=3)",
            ]
        );

        let racks: BTreeSet<&RackKey> = plan.actions.iter().map(|a| a.rack()).collect();
        assert_eq!(racks.len(), plan.actions.len());
    }

    #[test]
    fn test_config_change_produces_update_config() {
        let desired = spec(&[("dc1", "rack1", 2)]).desired_racks();
        let mut observed_rack = observed_like(&desired[0], 2);
        observed_rack.workload.as_mut().unwrap().config_hash = Some("old".to_string());
        let mut observed = Topology::default();
        observed.racks.insert(key("dc1", "rack1"), observed_rack);

        let plan = plan(&desired, &observed, &BTreeSet::new(), limits(1)).unwrap();
        assert_eq!(
            plan.actions,
            vec![Action::UpdateConfig {
                rack: key("dc1", "rack1"),
                config_hash: desired[0].config_hash.clone(),
            }]
        );
    }

    #[test]
    fn test_converged_plan_is_empty() {
        let desired = spec(&[("dc1", "rack1", 3)]).desired_racks();
        let mut observed = Topology::default();
        observed
            .racks
            .insert(key("dc1", "rack1"), observed_like(&desired[0], 3));

        let plan = plan(&desired, &observed, &BTreeSet::new(), limits(1)).unwrap();
        assert!(plan.is_converged());
    }

    #[test]
    fn test_undesired_rack_waits_for_data_before_scaling() {
        let desired = spec(&[("dc1", "rack1", 1)]).desired_racks();
        let gone = spec(&[("dc1", "rack2", 2)]).desired_racks();

        let mut observed = Topology::default();
        observed
            .racks
            .insert(key("dc1", "rack1"), observed_like(&desired[0], 1));
        observed
            .racks
            .insert(key("dc1", "rack2"), observed_like(&gone[0], 2));

        // Both nodes may still own ranges: nothing is scaled away
        let plan1 = plan(&desired, &observed, &BTreeSet::new(), limits(1)).unwrap();
        assert!(plan1.actions.is_empty());
        assert_eq!(
            plan1.deferred,
            vec![Deferral {
                rack: key("dc1", "rack2"),
                reason: DeferReason::NodesOwnData {
                    nodes: vec![
                        "demo-dc1-rack2-1".to_string(),
                        "demo-dc1-rack2-0".to_string()
                    ]
                },
            }]
        );

        // One node decommissioned, the other still owns data
        let mut partial = observed_like(&gone[0], 2);
        partial.nodes[1].owns_data = Some(false);
        partial.nodes[0].owns_data = Some(true);
        observed.racks.insert(key("dc1", "rack2"), partial);
        let plan2 = plan(&desired, &observed, &BTreeSet::new(), limits(1)).unwrap();
        assert!(plan2.actions.is_empty());
        assert_eq!(
            plan2.deferred[0].reason,
            DeferReason::NodesOwnData {
                nodes: vec!["demo-dc1-rack2-0".to_string()]
            }
        );

        // Every node reports zero ownership: scale to zero, then remove
        let mut drained = observed_like(&gone[0], 2);
        for n in drained.nodes.iter_mut() {
            n.owns_data = Some(false);
        }
        observed.racks.insert(key("dc1", "rack2"), drained);
        let plan3 = plan(&desired, &observed, &BTreeSet::new(), limits(1)).unwrap();
        assert_eq!(
            plan3.actions,
            vec![Action::ScaleRack {
                rack: key("dc1", "rack2"),
                from: 2,
                to: 0
            }]
        );

        let mut emptied = observed_like(&gone[0], 0);
        emptied.nodes.push(node("demo-dc1-rack2-0", 0, Some(false)));
        observed.racks.insert(key("dc1", "rack2"), emptied);
        let plan4 = plan(&desired, &observed, &BTreeSet::new(), limits(1)).unwrap();
        assert_eq!(
            plan4.actions,
            vec![Action::RemoveRack {
                rack: key("dc1", "rack2")
            }]
        );
    }

    #[test]
    fn test_undesired_rack_in_flight_is_deferred() {
        let gone = spec(&[("dc1", "rack2", 1)]).desired_racks();
        let mut observed = Topology::default();
        observed
            .racks
            .insert(key("dc1", "rack2"), observed_like(&gone[0], 1));

        let in_flight = BTreeSet::from([key("dc1", "rack2")]);
        let plan = plan(&[], &observed, &in_flight, limits(1)).unwrap();
        assert_eq!(plan.deferred[0].reason, DeferReason::InFlight);
    }

    #[test]
    fn test_scale_down_waits_for_removed_ordinals() {
        let desired = spec(&[("dc1", "rack1", 2)]).desired_racks();
        let mut observed = Topology::default();
        let mut rack = observed_like(&desired[0], 4);
        // Ordinals kept by the new count may own data freely
        rack.nodes[0].owns_data = Some(true);
        rack.nodes[1].owns_data = Some(true);
        observed.racks.insert(key("dc1", "rack1"), rack.clone());

        let plan1 = plan(&desired, &observed, &BTreeSet::new(), limits(1)).unwrap();
        assert!(plan1.actions.is_empty());
        assert_eq!(
            plan1.deferred,
            vec![Deferral {
                rack: key("dc1", "rack1"),
                reason: DeferReason::NodesOwnData {
                    nodes: vec![
                        "demo-dc1-rack1-3".to_string(),
                        "demo-dc1-rack1-2".to_string()
                    ]
                },
            }]
        );

        rack.nodes[2].owns_data = Some(false);
        rack.nodes[3].owns_data = Some(false);
        observed.racks.insert(key("dc1", "rack1"), rack);
        let plan2 = plan(&desired, &observed, &BTreeSet::new(), limits(1)).unwrap();
        assert_eq!(
            plan2.actions,
            vec![Action::ScaleRack {
                rack: key("dc1", "rack1"),
                from: 4,
                to: 2
            }]
        );
    }

    #[test]
    fn test_duplicate_rack_is_plan_error() {
        let mut desired = spec(&[("dc1", "rack1", 3)]).desired_racks();
        desired.push(desired[0].clone());

        let err = plan(&desired, &Topology::default(), &BTreeSet::new(), limits(1)).unwrap_err();
        assert_eq!(err, PlanError::DuplicateRack(key("dc1", "rack1")));
    }

    #[test]
    fn test_zero_replicas_with_data_is_plan_error() {
        let desired = spec(&[("dc1", "rack1", 0)]).desired_racks();
        let with_data = spec(&[("dc1", "rack1", 2)]).desired_racks();
        let mut observed = Topology::default();
        observed
            .racks
            .insert(key("dc1", "rack1"), observed_like(&with_data[0], 2));

        let err = plan(&desired, &observed, &BTreeSet::new(), limits(1)).unwrap_err();
        assert!(matches!(err, PlanError::ZeroReplicasWithData { .. }));
    }

    #[test]
    fn test_zero_replicas_without_data_is_allowed() {
        let desired = spec(&[("dc1", "rack1", 0)]).desired_racks();
        let plan = plan(&desired, &Topology::default(), &BTreeSet::new(), limits(1)).unwrap();
        assert_eq!(
            plan.actions,
            vec![Action::AddRack {
                rack: key("dc1", "rack1"),
                replicas: 0
            }]
        );
    }

    #[test]
    fn test_concurrency_limit_allows_several_racks() {
        let desired = spec(&[("dc1", "rack1", 3), ("dc1", "rack2", 3), ("dc1", "rack3", 3)])
            .desired_racks();
        let plan = plan(&desired, &Topology::default(), &BTreeSet::new(), limits(2)).unwrap();

        assert_eq!(plan.actions.len(), 2);
        assert_eq!(plan.actions[0].rack(), &key("dc1", "rack1"));
        assert_eq!(plan.actions[1].rack(), &key("dc1", "rack2"));
        assert_eq!(plan.deferred[0].reason, DeferReason::ConcurrencyLimit);
    }
}

#[cfg(test)]
mod proptests {
    use std::collections::{BTreeMap, BTreeSet};

    use proptest::prelude::*;

    use super::super::planner::*;
    use super::super::topology::{
        NodeHealth, NodeObservation, ObservedRack, Topology, WorkloadObservation,
    };
    use crate::crd::{CassandraClusterSpec, Datacenter, Rack, RackKey, Topology as SpecTopology};

    const RACKS: [&str; 4] = ["rack0", "rack1", "rack2", "rack3"];

    fn desired_racks(replicas: &[Option<i32>]) -> Vec<crate::crd::DesiredRack> {
        let racks = RACKS
            .iter()
            .zip(replicas)
            .filter_map(|(name, count)| {
                count.map(|count| Rack {
                    name: name.to_string(),
                    nodes_per_racks: Some(count),
                    ..Default::default()
                })
            })
            .collect();
        CassandraClusterSpec {
            topology: SpecTopology {
                dc: vec![Datacenter {
                    name: "dc1".to_string(),
                    rack: racks,
                    ..Default::default()
                }],
            },
            ..Default::default()
        }
        .desired_racks()
    }

    fn observed(racks: &[Option<Vec<Option<bool>>>]) -> Topology {
        let mut topology = Topology {
            racks: BTreeMap::new(),
        };
        for (name, nodes) in RACKS.iter().zip(racks) {
            let Some(nodes) = nodes else { continue };
            let rack = ObservedRack {
                workload: Some(WorkloadObservation {
                    name: format!("demo-dc1-{name}"),
                    replicas: nodes.len() as i32,
                    image: Some("cassandra:3.11.10".to_string()),
                    config_hash: None,
                    settled: true,
                }),
                nodes: nodes
                    .iter()
                    .enumerate()
                    .map(|(i, owns_data)| NodeObservation {
                        name: format!("demo-dc1-{name}-{i}"),
                        ordinal: i as u32,
                        ready: true,
                        health: NodeHealth::Up,
                        owns_data: *owns_data,
                        trigger: None,
                    })
                    .collect(),
            };
            topology.racks.insert(RackKey::new("dc1", *name), rack);
        }
        topology
    }

    fn rank(action: &Action) -> u8 {
        match action {
            Action::AddRack { .. } => 0,
            Action::ScaleRack { from, to, .. } if to > from => 1,
            Action::UpdateImage { .. } => 2,
            Action::UpdateConfig { .. } => 3,
            Action::ScaleRack { .. } => 4,
            Action::RemoveRack { .. } => 5,
        }
    }

    proptest! {
        /// No action removes a node that may still own token ranges.
        #[test]
        fn never_scales_away_data_owners(
            wanted in proptest::collection::vec(proptest::option::of(0i32..4), 4),
            current in proptest::collection::vec(
                proptest::option::of(proptest::collection::vec(proptest::option::of(any::<bool>()), 0..5)),
                4,
            ),
            limit in 1usize..4,
        ) {
            let desired = desired_racks(&wanted);
            let topology = observed(&current);
            let Ok(plan) = plan(&desired, &topology, &BTreeSet::new(), PlanLimits {
                max_concurrent_rack_updates: limit,
            }) else {
                return Ok(());
            };

            for action in &plan.actions {
                let rack = topology.rack(action.rack());
                let kept = match action {
                    Action::ScaleRack { from, to, .. } if to < from => Some(*to as u32),
                    Action::RemoveRack { .. } => Some(0),
                    _ => None,
                };
                if let (Some(kept), Some(rack)) = (kept, rack) {
                    for node in rack.nodes.iter().filter(|n| n.ordinal >= kept) {
                        prop_assert!(node.holds_no_data(), "{action} drops {}", node.name);
                    }
                }
            }
        }

        /// One action per rack, globally ordered, capped, and none for racks in flight.
        #[test]
        fn actions_are_ordered_and_bounded(
            wanted in proptest::collection::vec(proptest::option::of(0i32..4), 4),
            current in proptest::collection::vec(
                proptest::option::of(proptest::collection::vec(Just(Some(false)), 0..5)),
                4,
            ),
            busy in proptest::collection::vec(any::<bool>(), 4),
            limit in 1usize..4,
        ) {
            let desired = desired_racks(&wanted);
            let topology = observed(&current);
            let in_flight: BTreeSet<RackKey> = RACKS
                .iter()
                .zip(&busy)
                .filter(|(_, busy)| **busy)
                .map(|(name, _)| RackKey::new("dc1", *name))
                .collect();
            let plan = plan(&desired, &topology, &in_flight, PlanLimits {
                max_concurrent_rack_updates: limit,
            })
            .unwrap();

            prop_assert!(plan.actions.len() <= limit);
            let racks: BTreeSet<&RackKey> = plan.actions.iter().map(|a| a.rack()).collect();
            prop_assert_eq!(racks.len(), plan.actions.len());
            for action in &plan.actions {
                prop_assert!(!in_flight.contains(action.rack()));
            }
            for pair in plan.actions.windows(2) {
                let order = (rank(&pair[0]), pair[0].rack()).cmp(&(rank(&pair[1]), pair[1].rack()));
                prop_assert!(order.is_lt(), "{} before {}", pair[0], pair[1]);
            }
        }
    }
}

