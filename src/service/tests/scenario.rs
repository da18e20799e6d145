//! Multi-node scenarios over in-memory topologies.

use super::*;
use crate::types::GroupKey;
use crate::wire::{Ack, Advertise, UnicastHeader};

/// Two-hop broadcast over the tree: A - B - C, A sources group 7 with
/// src_ttl 2, C subscribes. One advertise cycle and one ACK round trip
/// later, the tree exists and a payload crosses it exactly once.
#[tokio::test(start_paused = true)]
async fn two_hop_tree_forms_and_delivers() {
    let mut nodes = vec![TestNode::new(1), TestNode::new(2), TestNode::new(3)];
    let links = [(0, 1), (1, 2)];
    let (src_session, mut src_rx) = announce(&mut nodes[0], 7, Some(1.0), 2, 0);
    let (_sub_session, mut sub_rx) = subscribe(&mut nodes[2], 7);

    tokio::time::advance(Duration::from_secs(1)).await;
    nodes[0].svc.fire_due_timers();
    settle_network(&mut nodes, &links).await;

    assert_eq!(nodes[2].svc.local_sub_count(7), 1);
    assert!(
        got_pull(&recv_pushes(&mut src_rx), 7),
        "the ACK round trip unblocks the source"
    );
    assert!(
        nodes[1].svc.remote_subs.has_subs(7),
        "the middle node joined the relay set"
    );

    client_data(&mut nodes[0], src_session, 7, b"hello");
    settle_network(&mut nodes, &links).await;

    let payloads = delivered_payloads(&mut sub_rx);
    assert_eq!(
        payloads.iter().filter(|p| p.as_slice() == b"hello").count(),
        1,
        "exactly one delivery at the subscriber"
    );
}

/// Flood-mode TTL upgrade: the first copy dies one hop short; a
/// retransmission of the same sequence with more budget gets through.
#[tokio::test(start_paused = true)]
async fn advertise_ttl_upgrade_extends_reach() {
    let mut b = TestNode::new(2);
    let mut c = TestNode::new(3);

    let adv = |ttl| {
        let mut msg = OtaMessage::new(1);
        msg.advertises.push(Advertise {
            gid: 7,
            src_node: 1,
            seq: 1,
            src_ttl: 2,
            ttl,
            distance: 0,
            prob_relay: 0,
            no_ttl_regen: false,
        });
        msg
    };

    // ttl 1 reaches B; B's forward leaves with ttl 0 and dies at C
    b.deliver(&adv(1));
    b.settle().await;
    let frames = b.drain();
    assert_eq!(frames[0].advertises[0].ttl, 0);
    for frame in &frames {
        c.deliver(frame);
    }
    c.settle().await;
    assert!(c.drain().is_empty());
    assert!(!c.svc.adv_seen.contains(7, 1, 1));

    // the same sequence retransmitted with ttl 2 raises B's stored
    // maximum and crosses to C
    b.deliver(&adv(2));
    b.settle().await;
    let frames = b.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].advertises[0].ttl, 1);
    for frame in &frames {
        c.deliver(frame);
    }
    c.settle().await;
    assert!(c.svc.adv_seen.contains(7, 1, 1));
    assert_eq!(c.drain().len(), 1, "C now forwards in turn");
}

/// Obligatory relay election with prob_relay 0: of two disjoint two-hop
/// paths, only the relay that delivered the ADVERTISE first carries the
/// ACK back.
#[tokio::test(start_paused = true)]
async fn only_the_first_delivering_relay_is_elected() {
    let mut nodes = vec![
        TestNode::new(1), // source
        TestNode::new(2), // relay candidate R1
        TestNode::new(3), // relay candidate R2
        TestNode::new(4), // subscriber
    ];
    let links = [(0, 1), (0, 2), (1, 3), (2, 3)];
    let (_src_session, mut src_rx) = announce(&mut nodes[0], 7, Some(1.0), 3, 0);
    subscribe(&mut nodes[3], 7);

    tokio::time::advance(Duration::from_secs(1)).await;
    nodes[0].svc.fire_due_timers();
    settle_network(&mut nodes, &links).await;

    let r1 = nodes[1].svc.remote_subs.has_subs(7);
    let r2 = nodes[2].svc.remote_subs.has_subs(7);
    assert!(r1 ^ r2, "exactly one candidate may join the relay set");

    // the subscriber's reverse path names the elected relay
    let elected = if r1 { 2 } else { 3 };
    assert_eq!(
        nodes[3]
            .svc
            .reverse_paths
            .get(GroupKey::new(7, 1))
            .unwrap()
            .next_hop,
        elected
    );
    assert!(got_pull(&recv_pushes(&mut src_rx), 7));
}

/// Unicast along the reverse path: the subscriber answers the source and
/// the payload arrives exactly once, carried only by the tree relay.
#[tokio::test(start_paused = true)]
async fn unicast_response_rides_the_reverse_path() {
    let mut nodes = vec![TestNode::new(1), TestNode::new(2), TestNode::new(3)];
    let links = [(0, 1), (1, 2)];
    let (_src_session, mut src_rx) = announce(&mut nodes[0], 7, Some(1.0), 2, 0);
    let (sub_session, _sub_rx) = subscribe(&mut nodes[2], 7);

    tokio::time::advance(Duration::from_secs(1)).await;
    nodes[0].svc.fire_due_timers();
    settle_network(&mut nodes, &links).await;
    recv_pushes(&mut src_rx); // clear the PULL

    // the subscriber's distance to the source came from the advertise
    assert_eq!(
        nodes[2]
            .svc
            .distances
            .distance_to(GroupKey::new(7, 1))
            .unwrap(),
        2
    );

    nodes[2].svc.on_client_message(
        sub_session,
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
                    dest: 1,
                    relay_distance: 0,
                    resilience: Some(crate::types::Resilience::Medium),
                }),
                payload: b"pong".to_vec(),
            }],
            ..Default::default()
        },
    );
    settle_network(&mut nodes, &links).await;

    let payloads = delivered_payloads(&mut src_rx);
    assert_eq!(
        payloads.iter().filter(|p| p.as_slice() == b"pong").count(),
        1,
        "the response reaches the source's client exactly once"
    );
}

/// When every remote subscriber ages out, the source is told to stop, and
/// a later ACK starts it again.
#[tokio::test(start_paused = true)]
async fn source_is_stopped_and_restarted_with_its_subscribers() {
    let mut config = ServiceConfig::new(1);
    config.pull_expire = Duration::from_secs(2);
    let mut node = TestNode::with_config(config);
    let (_session, mut rx) = announce(&mut node, 7, Some(1.0), 2, 0);

    let ack = |seq| {
        let mut msg = OtaMessage::new(5);
        msg.acks.push(Ack {
            gid: 7,
            src_node: 1,
            seq,
            obligatory_relay: 1,
            prob_of_relay: 0,
        });
        msg
    };

    node.deliver(&ack(1));
    assert!(got_pull(&recv_pushes(&mut rx), 7));

    // no ACK refresh within the expiry window
    tokio::time::advance(Duration::from_secs(3)).await;
    node.svc.remote_subs_cleanup();
    let pushes = recv_pushes(&mut rx);
    assert!(got_unpull(&pushes, 7), "empty subscriber set stops the source");
    assert!(!node.svc.remote_subs.has_subs(7));

    // a returning subscriber unblocks it again
    node.deliver(&ack(2));
    assert!(got_pull(&recv_pushes(&mut rx), 7));
}
