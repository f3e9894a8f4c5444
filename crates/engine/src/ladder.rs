//! Bitrate-to-resolution ladder.
//!
//! Low bitrates cannot carry full-HD detail, so the output is shrunk to a
//! bounding box chosen by the video bitrate. The box is expressed as
//! (long side, short side) so portrait clips get the same treatment.

/// One rung of the ladder: bitrates below `below_bps` fit in `long` x `short`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rung {
    pub below_bps: u64,
    pub long: u32,
    pub short: u32,
}

/// Rungs in ascending bitrate order; the last one is open-ended
pub const DEFAULT_LADDER: &[Rung] = &[
    Rung { below_bps: 300_000, long: 854, short: 480 },
    Rung { below_bps: 500_000, long: 960, short: 540 },
    Rung { below_bps: 800_000, long: 1280, short: 720 },
    Rung { below_bps: u64::MAX, long: 1920, short: 1080 },
];

/// Pick the bounding box for a video bitrate
pub fn rung_for(video_bitrate_bps: u64) -> Rung {
    DEFAULT_LADDER
        .iter()
        .copied()
        .find(|r| video_bitrate_bps < r.below_bps)
        .unwrap_or(DEFAULT_LADDER[DEFAULT_LADDER.len() - 1])
}

/// Output resolution for a source at a given video bitrate.
///
/// Never upscales, keeps the aspect ratio, and rounds both dimensions down to
/// an even number. Unknown sources (a zero dimension) get the rung's box.
pub fn scale(width: u32, height: u32, video_bitrate_bps: u64) -> (u32, u32) {
    let rung = rung_for(video_bitrate_bps);

    if width == 0 || height == 0 {
        return (rung.long, rung.short);
    }

    let landscape = width >= height;
    let (long, short) = if landscape { (width, height) } else { (height, width) };

    let (out_long, out_short) = if long <= rung.long && short <= rung.short {
        (long, short)
    } else if rung.long as u64 * short as u64 <= rung.short as u64 * long as u64 {
        // Long side binds
        (rung.long, (short as u64 * rung.long as u64 / long as u64) as u32)
    } else {
        ((long as u64 * rung.short as u64 / short as u64) as u32, rung.short)
    };

    let (out_long, out_short) = (even_floor(out_long), even_floor(out_short));

    if landscape {
        (out_long, out_short)
    } else {
        (out_short, out_long)
    }
}

fn even_floor(v: u32) -> u32 {
    (v & !1).max(2)
}
