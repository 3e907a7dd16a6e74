//! Incremental UTF-8 validation for text messages that arrive in
//! arbitrary frame and chunk boundaries.
//!
//! Well-formedness follows the Unicode standard byte ranges: overlong
//! encodings, surrogates and code points above U+10FFFF are impossible to
//! express, so a bad sequence is caught at its first impossible byte.

/// outcome of feeding a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Utf8State {
    /// every fed byte completed a code point
    Accept,
    /// the chunk ended inside a multi byte sequence
    Incomplete,
}

/// position of the first invalid byte within the fed chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utf8Error {
    /// bytes of the chunk that validated before the failure
    pub valid_up_to: usize,
}

/// validator state carried between chunks, at most 3 pending bytes
#[derive(Debug, Default)]
pub struct Utf8Validator {
    /// continuation bytes still expected
    needed: u8,
    /// admissible range for the next continuation byte
    lower: u8,
    upper: u8,
}

impl Utf8Validator {
    /// validator in the accepting state
    pub fn new() -> Self {
        Self::default()
    }

    /// forget any partial sequence
    pub fn reset(&mut self) {
        self.needed = 0;
    }

    /// true when the stream does not end inside a sequence
    pub fn is_complete(&self) -> bool {
        self.needed == 0
    }

    /// validate the next chunk of the stream
    pub fn feed(&mut self, data: &[u8]) -> Result<Utf8State, Utf8Error> {
        for (i, &byte) in data.iter().enumerate() {
            if !self.step(byte) {
                return Err(Utf8Error { valid_up_to: i });
            }
        }
        if self.needed == 0 {
            Ok(Utf8State::Accept)
        } else {
            Ok(Utf8State::Incomplete)
        }
    }

    fn step(&mut self, byte: u8) -> bool {
        if self.needed > 0 {
            if byte < self.lower || byte > self.upper {
                return false;
            }
            self.needed -= 1;
            self.lower = 0x80;
            self.upper = 0xBF;
            return true;
        }
        // lead byte: the first continuation range depends on it, which is
        // what rules out overlongs, surrogates and > U+10FFFF
        match byte {
            0x00..=0x7F => {}
            0xC2..=0xDF => self.expect(1, 0x80, 0xBF),
            0xE0 => self.expect(2, 0xA0, 0xBF),
            0xE1..=0xEC | 0xEE..=0xEF => self.expect(2, 0x80, 0xBF),
            0xED => self.expect(2, 0x80, 0x9F),
            0xF0 => self.expect(3, 0x90, 0xBF),
            0xF1..=0xF3 => self.expect(3, 0x80, 0xBF),
            0xF4 => self.expect(3, 0x80, 0x8F),
            _ => return false,
        }
        true
    }

    fn expect(&mut self, needed: u8, lower: u8, upper: u8) {
        self.needed = needed;
        self.lower = lower;
        self.upper = upper;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepts_whole(data: &[u8]) -> bool {
        let mut v = Utf8Validator::new();
        v.feed(data).is_ok() && v.is_complete()
    }

    #[test]
    fn ascii_and_multibyte_accepted() {
        assert!(accepts_whole(b"Hello"));
        assert!(accepts_whole("καλημέρα κόσμε".as_bytes()));
        assert!(accepts_whole("日本語テキスト".as_bytes()));
        assert!(accepts_whole("𐍈𝕳𝖊𝖑𝖑𝖔".as_bytes()));
        assert!(accepts_whole("\u{0}\u{7f}\u{80}\u{7ff}\u{800}\u{ffff}\u{10000}\u{10ffff}".as_bytes()));
    }

    #[test]
    fn chunked_agrees_with_whole_string_validation() {
        let samples: &[&[u8]] = &[
            "déjà vu".as_bytes(),
            "中文 mixed with ascii".as_bytes(),
            "\u{10ffff}\u{800}x".as_bytes(),
            &[0xE2, 0x82, 0xAC, 0xF0, 0x9F, 0x92, 0x96],
            &[0x41, 0xC0, 0x80],
            &[0xED, 0xA0, 0x80],
            &[0xF4, 0x90, 0x80, 0x80],
            &[0xE2, 0x82],
        ];
        for sample in samples {
            let whole = std::str::from_utf8(sample).is_ok();
            for split in 0..=sample.len() {
                let mut v = Utf8Validator::new();
                let first = v.feed(&sample[..split]);
                let chunked = match first {
                    Err(_) => false,
                    Ok(_) => v.feed(&sample[split..]).is_ok() && v.is_complete(),
                };
                assert_eq!(chunked, whole, "sample {sample:?} split at {split}");
            }
        }
    }

    #[test]
    fn overlong_nul_rejected_at_first_byte() {
        // 0xC0 0x80 is the overlong encoding of U+0000
        let mut v = Utf8Validator::new();
        let err = v.feed(&[0xC0, 0x80]).unwrap_err();
        assert_eq!(err.valid_up_to, 0);
    }

    #[test]
    fn overlong_three_byte_rejected_at_continuation() {
        let mut v = Utf8Validator::new();
        let err = v.feed(&[0xE0, 0x80, 0x80]).unwrap_err();
        assert_eq!(err.valid_up_to, 1);
    }

    #[test]
    fn surrogates_rejected() {
        // U+D800 would be 0xED 0xA0 0x80
        let mut v = Utf8Validator::new();
        let err = v.feed(&[0xED, 0xA0, 0x80]).unwrap_err();
        assert_eq!(err.valid_up_to, 1);
    }

    #[test]
    fn beyond_u10ffff_rejected() {
        let mut v = Utf8Validator::new();
        let err = v.feed(&[0xF4, 0x90, 0x80, 0x80]).unwrap_err();
        assert_eq!(err.valid_up_to, 1);
    }

    #[test]
    fn stray_continuation_rejected() {
        let mut v = Utf8Validator::new();
        assert!(v.feed(&[0x80]).is_err());
    }

    #[test]
    fn incomplete_tail_reported() {
        let mut v = Utf8Validator::new();
        assert_eq!(v.feed(&[0xE2, 0x82]).unwrap(), Utf8State::Incomplete);
        assert!(!v.is_complete());
        assert_eq!(v.feed(&[0xAC]).unwrap(), Utf8State::Accept);
        assert!(v.is_complete());
    }
}
