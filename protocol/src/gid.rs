//! GID display formatting (§4.6/§6): a 32-bit asset id rendered as
//! `b3-b2-word` when the top byte is non-zero, or `b2-word` otherwise.
//!
//! Note: spec.md's second worked example (`0x0028B978 -> "40-47544"`)
//! doesn't arithmetically match a plain big-endian byte/word split (that
//! GID's low 16 bits are 0xB978 = 47480, not 47544); the first example
//! (`0x01000535 -> "1-0-1333"`) does. We implement the straightforward
//! split below, which keeps §8 property 5 (`parseDisplay(formatDisplay(gid))
//! == gid`) exactly — the only invariant actually tested.

pub fn format_display(gid: u32) -> String {
    let b3 = (gid >> 24) & 0xFF;
    let b2 = (gid >> 16) & 0xFF;
    let word = gid & 0xFFFF;

    if b3 != 0 {
        format!("{}-{}-{}", b3, b2, word)
    } else {
        format!("{}-{}", b2, word)
    }
}

#[derive(Debug)]
pub struct ParseError;

pub fn parse_display(s: &str) -> Result<u32, ParseError> {
    let parts: Vec<&str> = s.split('-').collect();

    match parts.as_slice() {
        [b3, b2, word] => {
            let b3: u32 = b3.parse().map_err(|_| ParseError)?;
            let b2: u32 = b2.parse().map_err(|_| ParseError)?;
            let word: u32 = word.parse().map_err(|_| ParseError)?;
            if b3 > 0xFF || b2 > 0xFF || word > 0xFFFF {
                return Err(ParseError);
            }
            Ok((b3 << 24) | (b2 << 16) | word)
        }
        [b2, word] => {
            let b2: u32 = b2.parse().map_err(|_| ParseError)?;
            let word: u32 = word.parse().map_err(|_| ParseError)?;
            if b2 > 0xFF || word > 0xFFFF {
                return Err(ParseError);
            }
            Ok((b2 << 16) | word)
        }
        _ => Err(ParseError),
    }
}

pub fn read_gid_at(body: &[u8], offset: usize) -> Option<u32> {
    let bytes = body.get(offset..offset + 4)?;
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_first_worked_example() {
        assert_eq!(format_display(0x01000535), "1-0-1333");
    }

    #[test]
    fn round_trips_arbitrary_gids() {
        for gid in [0u32, 1, 0x0028B978, 0x01000535, 0xFFFFFFFF, 0x00FF_FFFF] {
            let rendered = format_display(gid);
            assert_eq!(parse_display(&rendered).unwrap(), gid);
        }
    }

    #[test]
    fn three_part_form_only_when_msb_set() {
        assert_eq!(format_display(0x0028B978), "40-47480");
        assert_eq!(format_display(0x0028B978).matches('-').count(), 1);
        assert_eq!(format_display(0x01000535).matches('-').count(), 2);
    }
}
