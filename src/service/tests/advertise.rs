//! ADVERTISE ingress: forwarding policy, TTL regeneration and upgrade,
//! reverse-path maintenance, and ACK scheduling.

use super::*;
use crate::types::GroupKey;
use crate::wire::Advertise;

fn adv_frame(ota_src: u32, adv: Advertise) -> OtaMessage {
    let mut msg = OtaMessage::new(ota_src);
    msg.advertises.push(adv);
    msg
}

fn sample_adv(seq: u32, ttl: u32) -> Advertise {
    Advertise {
        gid: 7,
        src_node: 3,
        seq,
        src_ttl: 3,
        ttl,
        distance: 0,
        prob_relay: 60,
        no_ttl_regen: false,
    }
}

#[tokio::test(start_paused = true)]
async fn group_node_regenerates_ttl_and_acks() {
    let mut node = TestNode::new(1);
    subscribe(&mut node, 7);

    node.deliver(&adv_frame(5, sample_adv(1, 1)));
    node.settle().await;

    let frames = node.drain();
    // the forwarded advertise goes first (microsecond jitter), the ACK
    // second (its window is 100-200 ms)
    assert_eq!(frames.len(), 2);

    let adv = &frames[0].advertises[0];
    assert_eq!(adv.ttl, 2, "regenerated to src_ttl then decremented");
    assert_eq!(adv.distance, 1, "one hop counted");

    let ack = &frames[1].acks[0];
    assert_eq!(ack.gid, 7);
    assert_eq!(ack.src_node, 3);
    assert_eq!(ack.seq, 1);
    assert_eq!(ack.obligatory_relay, 5, "whoever delivered the advertise");
    assert_eq!(ack.prob_of_relay, 60, "filled from the reverse path at send");
}

#[tokio::test(start_paused = true)]
async fn group_node_without_regeneration_spends_remaining_ttl() {
    let mut node = TestNode::new(1);
    subscribe(&mut node, 7);

    let mut adv = sample_adv(1, 2);
    adv.no_ttl_regen = true;
    node.deliver(&adv_frame(5, adv));
    node.settle().await;

    let frames = node.drain();
    assert_eq!(frames[0].advertises[0].ttl, 1);

    // with the budget exhausted the advertise dies here, but the ACK is
    // still owed
    let mut spent = sample_adv(2, 0);
    spent.no_ttl_regen = true;
    node.deliver(&adv_frame(5, spent));
    node.settle().await;

    let frames = node.drain();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].advertises.is_empty());
    assert_eq!(frames[0].acks[0].seq, 2);
}

#[tokio::test(start_paused = true)]
async fn non_group_node_forwards_only_with_ttl() {
    let mut node = TestNode::new(1);

    node.deliver(&adv_frame(5, sample_adv(1, 2)));
    node.settle().await;
    let frames = node.drain();
    assert_eq!(frames.len(), 1, "no ack from a non-participant");
    assert_eq!(frames[0].advertises[0].ttl, 1);

    // ttl 0 at a non-group node is the end of the road
    node.deliver(&adv_frame(5, sample_adv(2, 0)));
    node.settle().await;
    assert!(node.drain().is_empty());
    // and it is not even recorded as seen for the relay election
    assert!(!node.svc.adv_seen.contains(7, 3, 2));
}

#[tokio::test(start_paused = true)]
async fn duplicate_with_higher_ttl_is_reforwarded_once() {
    let mut node = TestNode::new(1);

    node.deliver(&adv_frame(5, sample_adv(1, 1)));
    node.settle().await;
    assert_eq!(node.drain().len(), 1);

    // plain duplicate: dropped
    node.deliver(&adv_frame(6, sample_adv(1, 1)));
    node.settle().await;
    assert!(node.drain().is_empty());

    // same frame, more budget: one more transmission
    node.deliver(&adv_frame(5, sample_adv(1, 2)));
    node.settle().await;
    let frames = node.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].advertises[0].ttl, 1);

    // equal budget again: back to dropping
    node.deliver(&adv_frame(6, sample_adv(1, 2)));
    node.settle().await;
    assert!(node.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn higher_ttl_copy_replaces_a_pending_transmission() {
    let mut node = TestNode::new(1);

    // two copies arrive inside one jitter window; only the better one is
    // actually transmitted
    node.deliver(&adv_frame(5, sample_adv(1, 1)));
    node.deliver(&adv_frame(6, sample_adv(1, 3)));
    node.settle().await;

    let frames = node.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].advertises[0].ttl, 2);
}

#[tokio::test(start_paused = true)]
async fn reverse_path_tracks_first_delivery_per_sequence() {
    let mut node = TestNode::new(1);
    let key = GroupKey::new(7, 3);

    node.deliver(&adv_frame(5, sample_adv(1, 2)));
    node.deliver(&adv_frame(6, sample_adv(1, 2))); // duplicate, later
    assert_eq!(node.svc.reverse_paths.get(key).unwrap().next_hop, 5);

    // a fresh sequence re-elects the upstream
    node.deliver(&adv_frame(6, sample_adv(2, 2)));
    let path = node.svc.reverse_paths.get(key).unwrap();
    assert_eq!(path.next_hop, 6);
    assert_eq!(path.last_seq, 2);
}

#[tokio::test(start_paused = true)]
async fn own_advertisement_echo_is_ignored() {
    let mut node = TestNode::new(1);
    let (_session, mut rx) = announce(&mut node, 7, Some(1.0), 2, 0);

    tokio::time::advance(Duration::from_secs(1)).await;
    node.svc.fire_due_timers();
    let emitted = node.drain();
    assert_eq!(emitted.len(), 1);

    // a neighbor forwards our own advertisement back to us
    let echoed = emitted[0].advertises[0].clone();
    node.deliver(&adv_frame(2, echoed));
    node.settle().await;

    assert!(node.drain().is_empty(), "no re-forward of our own frame");
    assert!(
        !got_pull(&recv_pushes(&mut rx), 7),
        "an echo is not a subscriber signal"
    );
}

#[tokio::test(start_paused = true)]
async fn distance_table_counts_advertising_neighbors() {
    let mut node = TestNode::new(1);
    let key = GroupKey::new(7, 3);

    node.deliver(&adv_frame(5, sample_adv(1, 2)));
    for neighbor in [6, 8, 9] {
        node.deliver(&adv_frame(neighbor, sample_adv(1, 2)));
    }
    assert_eq!(node.svc.distances.neighbor_count(key), 4);
    assert_eq!(node.svc.distances.distance_to(key), Some(1));
}
