//! SDP bandwidth shaping.
//!
//! The codec runtime ignores SDP bandwidth lines, so the offer is rewritten
//! before leaving the server: `b=AS`/`b=TIAS` lines after the connection
//! line of every video section, plus Chrome's `x-google-*-bitrate` fmtp
//! parameters. Audio sections pass through untouched.

/// Rewrite the video sections of an SDP to carry the target bitrate.
///
/// Applying the rewrite twice with the same bitrate is idempotent; applying
/// it with a new bitrate replaces the previous values.
pub fn apply_bitrate(sdp: &str, bitrate_bps: u64) -> String {
    let newline = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let bitrate_kbps = bitrate_bps / 1000;

    let mut result: Vec<String> = Vec::new();
    let mut in_video_section = false;

    for line in sdp.split(newline) {
        if line.starts_with("m=video") {
            in_video_section = true;
        } else if line.starts_with("m=") {
            in_video_section = false;
        }

        if in_video_section {
            // Drop bandwidth lines from a previous application so the
            // rewrite replaces rather than accumulates.
            if line.starts_with("b=AS:") || line.starts_with("b=TIAS:") {
                continue;
            }
            if line.starts_with("a=fmtp:") {
                result.push(rewrite_fmtp(line, bitrate_kbps));
                continue;
            }
        }

        result.push(line.to_owned());

        if in_video_section && line.starts_with("c=") {
            result.push(format!("b=AS:{bitrate_kbps}"));
            result.push(format!("b=TIAS:{bitrate_bps}"));
        }
    }

    result.join(newline)
}

fn rewrite_fmtp(line: &str, bitrate_kbps: u64) -> String {
    let (head, params) = match line.split_once(' ') {
        Some((head, params)) => (head, params),
        None => (line, ""),
    };
    let mut kept: Vec<&str> = params
        .split(';')
        .filter(|p| !p.is_empty())
        .filter(|p| {
            !p.starts_with("x-google-max-bitrate=")
                && !p.starts_with("x-google-min-bitrate=")
                && !p.starts_with("x-google-start-bitrate=")
        })
        .collect();
    let added = format!(
        "x-google-max-bitrate={};x-google-min-bitrate={};x-google-start-bitrate={}",
        bitrate_kbps,
        bitrate_kbps / 2,
        bitrate_kbps
    );
    kept.push(&added);
    format!("{} {}", head, kept.join(";"))
}
