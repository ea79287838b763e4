//! DWC Base64 Encoding
//!
//! The platform uses the URL-ish alphabet `A-Z a-z 0-9 . -` with `*` as the
//! padding character. The `base64` crate only pads with `=`, so padding is
//! translated at the edges.

use base64::alphabet::Alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;

use super::gamespy::CodecError;

const DWC_ALPHABET: Alphabet =
    match Alphabet::new("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789.-") {
        Ok(alphabet) => alphabet,
        Err(_) => panic!("invalid DWC base64 alphabet"),
    };

/// Engine for the DWC alphabet (emits `=` padding internally).
pub const DWC: GeneralPurpose = GeneralPurpose::new(
    &DWC_ALPHABET,
    GeneralPurposeConfig::new()
        .with_encode_padding(true)
        .with_decode_padding_mode(DecodePaddingMode::RequireCanonical),
);

/// Padding character used on the wire.
pub const DWC_PAD: char = '*';

/// Encode bytes with the DWC alphabet and `*` padding.
pub fn encode(data: &[u8]) -> String {
    DWC.encode(data).replace('=', "*")
}

/// Decode DWC base64 text.
pub fn decode(text: &str) -> Result<Vec<u8>, CodecError> {
    if text.contains('=') {
        return Err(CodecError::Base64("unexpected '=' padding".into()));
    }
    DWC.decode(text.replace(DWC_PAD, "="))
        .map_err(|e| CodecError::Base64(e.to_string()))
}
