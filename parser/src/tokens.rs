// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Byte-class predicates for HTTP/1.1 tokenizing, per RFC 9110/9112.

/// `tchar` per RFC 9110 Section 5.6.2, used for header field names.
#[inline]
pub fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}

/// `field-vchar` per RFC 9110 Section 5.5, used for header field values.
/// Accepts obs-text (bytes >= 0x80) for lenient interop, matching common
/// HTTP/1.1 parsers.
#[inline]
pub fn is_field_vchar(b: u8) -> bool {
    b == b'\t' || (0x20..=0xff).contains(&b) && b != 0x7f
}

/// Whitespace per RFC 9110 Section 5.6.3 `OWS`/`RWS`: space or horizontal tab.
#[inline]
pub fn is_ows(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Reason-phrase character class per RFC 9112 Section 4: any visible byte,
/// space, or tab.
#[inline]
pub fn is_reason_char(b: u8) -> bool {
    b == b'\t' || b == b' ' || (0x21..=0xff).contains(&b)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tchar_accepts_alnum_and_symbols() {
        assert!(is_tchar(b'A'));
        assert!(is_tchar(b'9'));
        assert!(is_tchar(b'-'));
        assert!(!is_tchar(b' '));
        assert!(!is_tchar(b':'));
    }

    #[test]
    fn field_vchar_rejects_control_bytes() {
        assert!(is_field_vchar(b'x'));
        assert!(is_field_vchar(b'\t'));
        assert!(!is_field_vchar(0x00));
        assert!(!is_field_vchar(0x7f));
    }
}
