//! Local client endpoint behavior: subscriptions, source registration,
//! and client DATA egress.

use super::*;
use crate::types::Resilience;
use crate::wire::UnicastHeader;

#[tokio::test(start_paused = true)]
async fn pull_then_unpull_leaves_subscriptions_unchanged() {
    let mut node = TestNode::new(1);
    let (session, _rx) = node.svc.add_test_session();

    node.svc.on_client_message(
        session,
        AppMessage {
            pulls: vec![Pull { gid: 7 }],
            ..Default::default()
        },
    );
    assert!(node.svc.is_group_participant(7));
    assert_eq!(node.svc.local_sub_count(7), 1);

    node.svc.on_client_message(
        session,
        AppMessage {
            unpulls: vec![Unpull { gid: 7 }],
            ..Default::default()
        },
    );
    assert!(!node.svc.is_group_participant(7));
    assert_eq!(node.svc.local_sub_count(7), 0);
}

#[tokio::test(start_paused = true)]
async fn unpull_removes_one_subscription_entry() {
    let mut node = TestNode::new(1);
    let (session, _rx) = node.svc.add_test_session();
    for _ in 0..2 {
        node.svc.on_client_message(
            session,
            AppMessage {
                pulls: vec![Pull { gid: 7 }],
                ..Default::default()
            },
        );
    }
    assert_eq!(node.svc.local_sub_count(7), 2);

    node.svc.on_client_message(
        session,
        AppMessage {
            unpulls: vec![Unpull { gid: 7 }],
            ..Default::default()
        },
    );
    assert_eq!(node.svc.local_sub_count(7), 1);
}

#[tokio::test(start_paused = true)]
async fn announce_emits_on_interval_and_deregister_cancels() {
    let mut node = TestNode::new(1);
    let (session, _rx) = announce(&mut node, 7, Some(1.0), 2, 40);

    // nothing before the first interval has elapsed
    tokio::time::advance(Duration::from_millis(900)).await;
    node.svc.fire_due_timers();
    assert!(node.drain().is_empty());

    tokio::time::advance(Duration::from_millis(150)).await;
    node.svc.fire_due_timers();
    let frames = node.drain();
    assert_eq!(frames.len(), 1);
    let adv = &frames[0].advertises[0];
    assert_eq!(adv.gid, 7);
    assert_eq!(adv.seq, 1);
    assert_eq!(adv.src_ttl, 2);
    assert_eq!(adv.ttl, 1); // decremented on the way out
    assert_eq!(adv.distance, 0);
    assert_eq!(adv.prob_relay, 40);

    node.svc.on_client_message(
        session,
        AppMessage {
            advertises: vec![AppAdvertise {
                gid: 7,
                src_ttl: 2,
                kind: AdvertiseKind::Deregister,
                interval: None,
                prob_relay: 0,
                no_ttl_regen: false,
            }],
            ..Default::default()
        },
    );
    tokio::time::advance(Duration::from_secs(3)).await;
    node.svc.fire_due_timers();
    assert!(node.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reregistering_same_parameters_keeps_the_running_timer() {
    let mut node = TestNode::new(1);
    let (session, _rx) = announce(&mut node, 7, Some(5.0), 2, 0);

    tokio::time::advance(Duration::from_secs(3)).await;
    node.svc.fire_due_timers();
    // identical re-registration must not restart the period
    node.svc.on_client_message(
        session,
        AppMessage {
            advertises: vec![AppAdvertise {
                gid: 7,
                src_ttl: 2,
                kind: AdvertiseKind::Register,
                interval: Some(5.0),
                prob_relay: 0,
                no_ttl_regen: false,
            }],
            ..Default::default()
        },
    );

    // the original timer fires at t=5, not t=8
    tokio::time::advance(Duration::from_millis(2100)).await;
    node.svc.fire_due_timers();
    let frames = node.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].advertises[0].seq, 1);
}

#[tokio::test(start_paused = true)]
async fn interval_change_rearms_the_timer() {
    let mut node = TestNode::new(1);
    let (session, _rx) = announce(&mut node, 7, Some(5.0), 2, 0);

    node.svc.on_client_message(
        session,
        AppMessage {
            advertises: vec![AppAdvertise {
                gid: 7,
                src_ttl: 2,
                kind: AdvertiseKind::Register,
                interval: Some(1.0),
                prob_relay: 0,
                no_ttl_regen: false,
            }],
            ..Default::default()
        },
    );

    tokio::time::advance(Duration::from_millis(1100)).await;
    node.svc.fire_due_timers();
    assert_eq!(node.drain().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn client_disconnect_cancels_the_announce_timer() {
    let mut node = TestNode::new(1);
    let (session, _rx) = announce(&mut node, 7, Some(1.0), 2, 0);

    // three ticks worth of advertisements
    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(1)).await;
        node.svc.fire_due_timers();
    }
    assert_eq!(node.drain().len(), 3);

    // client goes away at t=3.5; nothing may be emitted at or after t=4
    tokio::time::advance(Duration::from_millis(500)).await;
    node.svc.close_session(session);
    assert!(!node.svc.is_group_participant(7));

    tokio::time::advance(Duration::from_secs(2)).await;
    node.svc.fire_due_timers();
    assert!(node.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn flood_mode_data_spends_the_source_ttl() {
    let mut node = TestNode::new(1);
    // flood registration: no interval at all
    let (session, _rx) = announce(&mut node, 7, None, 3, 0);

    node.svc.on_client_message(
        session,
        AppMessage {
            data: vec![Data {
                gid: 7,
                src_node: 0,
                seq: 0,
                src_ttl: Some(3),
                ttl: 0,
                distance: 0,
                no_ttl_regen: false,
                unicast: None,
                payload: b"flood".to_vec(),
            }],
            ..Default::default()
        },
    );

    let frames = node.drain();
    assert_eq!(frames.len(), 1);
    let data = &frames[0].data[0];
    assert_eq!(data.seq, 1);
    assert_eq!(data.src_node, 1);
    assert_eq!(data.src_ttl, Some(3));
    assert_eq!(data.ttl, 2);
}

#[tokio::test(start_paused = true)]
async fn tree_mode_data_waits_for_a_remote_subscriber() {
    let mut node = TestNode::new(1);
    let (session, _rx) = announce(&mut node, 7, Some(10.0), 2, 0);

    client_data(&mut node, session, 7, b"early");
    assert!(node.drain().is_empty(), "no tree yet, nothing may go out");

    let now = node.svc.table_now();
    node.svc.remote_subs.mark(7, 9, now);
    client_data(&mut node, session, 7, b"later");

    let frames = node.drain();
    assert_eq!(frames.len(), 1);
    let data = &frames[0].data[0];
    assert_eq!(data.payload, b"later");
    assert_eq!(data.seq, 2); // the withheld payload still consumed a sequence
    assert_eq!(data.ttl, 0); // tree data goes out with zero remaining budget
    assert_eq!(data.src_ttl, None);
}

#[tokio::test(start_paused = true)]
async fn advertise_override_unblocks_on_foreign_advertise() {
    let mut node = TestNode::new(1);
    let (session, mut rx) = announce(&mut node, 7, Some(0.0), 2, 0);

    // override mode arms no timer of its own
    tokio::time::advance(Duration::from_secs(5)).await;
    node.svc.fire_due_timers();
    assert!(node.drain().is_empty());

    // another source of the same group advertises over the air
    let mut foreign = OtaMessage::new(5);
    foreign.advertises.push(crate::wire::Advertise {
        gid: 7,
        src_node: 5,
        seq: 1,
        src_ttl: 2,
        ttl: 1,
        distance: 0,
        prob_relay: 0,
        no_ttl_regen: false,
    });
    node.deliver(&foreign);

    let pushes = recv_pushes(&mut rx);
    assert!(got_pull(&pushes, 7), "override source must be unblocked");

    client_data(&mut node, session, 7, b"ride the foreign tree");
    let frames = node.drain();
    assert!(frames.iter().any(|f| !f.data.is_empty()));
}

#[tokio::test(start_paused = true)]
async fn unicast_relay_distance_follows_resilience() {
    let mut node = TestNode::new(1);
    let (session, _rx) = node.svc.add_test_session();

    // learn a distance of 2 to node 9 for group 7
    let mut adv = OtaMessage::new(5);
    adv.advertises.push(crate::wire::Advertise {
        gid: 7,
        src_node: 9,
        seq: 1,
        src_ttl: 3,
        ttl: 2,
        distance: 1,
        prob_relay: 0,
        no_ttl_regen: false,
    });
    node.deliver(&adv);
    node.settle().await;
    node.drain();

    for (resilience, expected) in [
        (Resilience::Low, 1),
        (Resilience::Medium, 2),
        (Resilience::High, 3),
    ] {
        node.svc.on_client_message(
            session,
            AppMessage {
                data: vec![Data {
                    gid: 7,
                    src_node: 0,
                    seq: 0,
                    src_ttl: None,
                    ttl: 0,
                    distance: 0,
                    no_ttl_regen: false,
                    unicast: Some(UnicastHeader {
                        dest: 9,
                        relay_distance: 0,
                        resilience: Some(resilience),
                    }),
                    payload: format!("probe {}", resilience).into_bytes(),
                }],
                ..Default::default()
            },
        );
        let frames = node.drain();
        assert_eq!(frames.len(), 1, "resilience {}", resilience);
        let header = frames[0].data[0].unicast.as_ref().unwrap();
        assert_eq!(header.relay_distance, expected, "resilience {}", resilience);
        assert_eq!(header.resilience, None, "resilience never goes over the air");
        assert_eq!(frames[0].data[0].ttl, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn unicast_without_distance_entry_is_not_sent() {
    let mut node = TestNode::new(1);
    let (session, _rx) = node.svc.add_test_session();
    node.svc.on_client_message(
        session,
        AppMessage {
            data: vec![Data {
                gid: 7,
                src_node: 0,
                seq: 0,
                src_ttl: None,
                ttl: 0,
                distance: 0,
                no_ttl_regen: false,
                unicast: Some(UnicastHeader {
                    dest: 9,
                    relay_distance: 0,
                    resilience: Some(Resilience::Medium),
                }),
                payload: b"nowhere to go".to_vec(),
            }],
            ..Default::default()
        },
    );
    assert!(node.drain().is_empty());
}

#[tokio::test(start_paused = true)]
#[should_panic(expected = "no announce entry")]
async fn deregister_without_registration_is_fatal() {
    let mut node = TestNode::new(1);
    let (session, _rx) = node.svc.add_test_session();
    node.svc.on_client_message(
        session,
        AppMessage {
            advertises: vec![AppAdvertise {
                gid: 7,
                src_ttl: 2,
                kind: AdvertiseKind::Deregister,
                interval: None,
                prob_relay: 0,
                no_ttl_regen: false,
            }],
            ..Default::default()
        },
    );
}

#[tokio::test(start_paused = true)]
#[should_panic(expected = "exceeds the remote-subscriber expiry")]
async fn announce_interval_beyond_pull_expiry_is_fatal() {
    let mut config = ServiceConfig::new(1);
    config.pull_expire = Duration::from_secs(10);
    let mut node = TestNode::with_config(config);
    announce(&mut node, 7, Some(20.0), 2, 0);
}
