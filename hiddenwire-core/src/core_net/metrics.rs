/*
    Metrics - counters and gauges for the connection layer

    - Traffic: frames sent / received, oversized frames rejected
    - Handshakes: proxy verdicts, authentication outcomes by reason
    - Lifecycle: TTL expirations, dispatch retries and timeouts, active peers

    Recording without an installed recorder is a no-op.
*/

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    describe_counter!("hiddenwire_frames_sent_total", "Frames fully written to a channel");
    describe_counter!("hiddenwire_frames_received_total", "Frames delivered by a channel");
    describe_counter!(
        "hiddenwire_oversized_frames_rejected_total",
        "Channels closed because a frame exceeded the configured maximum"
    );
    describe_counter!(
        "hiddenwire_proxy_handshakes_total",
        "Proxy handshakes, labeled by result (granted, rejected)"
    );
    describe_counter!(
        "hiddenwire_authentications_total",
        "Peer authentications, labeled by result and failure reason"
    );
    describe_counter!("hiddenwire_ttl_expirations_total", "Peers disconnected after their idle timer ran out");
    describe_counter!("hiddenwire_dispatch_retries_total", "Sends put back because no route was ready");
    describe_counter!("hiddenwire_dispatch_timeouts_total", "Sends failed because their timeout elapsed");
    describe_gauge!("hiddenwire_active_peers", "Currently authenticated peers");
}

pub fn frame_sent() {
    counter!("hiddenwire_frames_sent_total").increment(1);
}

pub fn frame_received() {
    counter!("hiddenwire_frames_received_total").increment(1);
}

pub fn oversized_frame_rejected() {
    counter!("hiddenwire_oversized_frames_rejected_total").increment(1);
}

pub fn proxy_handshake(granted: bool) {
    let result = if granted { "granted" } else { "rejected" };
    counter!("hiddenwire_proxy_handshakes_total", "result" => result).increment(1);
}

pub fn authentication_succeeded() {
    counter!("hiddenwire_authentications_total", "result" => "success", "reason" => "none").increment(1);
}

pub fn authentication_failed(reason: &'static str) {
    counter!("hiddenwire_authentications_total", "result" => "failure", "reason" => reason).increment(1);
}

pub fn ttl_expired() {
    counter!("hiddenwire_ttl_expirations_total").increment(1);
}

pub fn dispatch_retried() {
    counter!("hiddenwire_dispatch_retries_total").increment(1);
}

pub fn dispatch_timed_out() {
    counter!("hiddenwire_dispatch_timeouts_total").increment(1);
}

pub fn set_active_peers(count: usize) {
    gauge!("hiddenwire_active_peers").set(count as f64);
}
