use aes::cipher::{block_padding::NoPadding, BlockModeDecrypt, BlockModeEncrypt, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine};
use md5::{Digest, Md5};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const BLOCK: usize = 16;

/// Decryption succeeds only if the plaintext starts with this sentinel.
pub const XML_SENTINEL: &str = "<xml>";

fn derive_key(keyword: &str) -> [u8; 16] {
    Md5::digest(keyword.as_bytes()).into()
}

/// Prepends up to BLOCK-1 zero bytes so the result is a multiple of the
/// cipher block size. The wire dialect pads on the left, not PKCS#7.
fn left_padded(msg: &[u8]) -> Vec<u8> {
    let padding = (BLOCK - msg.len() % BLOCK) % BLOCK;
    let mut buf = vec![0u8; padding + msg.len()];
    buf[padding..].copy_from_slice(msg);
    buf
}

/// Encrypts `plaintext` with AES-128-CBC under MD5(`keyword`) and the
/// fixed `iv`, returning the standard base64 of the full ciphertext.
pub fn encrypt(plaintext: &str, keyword: &str, iv: &[u8; 16]) -> String {
    let key = derive_key(keyword);
    let mut buf = left_padded(plaintext.as_bytes());
    let len = buf.len();
    let ciphertext = Aes128CbcEnc::new(&key.into(), iv.into())
        .encrypt_padded::<NoPadding>(&mut buf, len)
        .expect("buffer length is a block multiple");
    STANDARD.encode(ciphertext)
}

/// Tries to open an envelope with `keyword`. Returns `None` unless the
/// result starts with `<xml>` after stripping zero bytes and whitespace.
///
/// `envelope` may be:
/// * a plaintext already starting with `<xml>` (returned trimmed), or
/// * a base64 ciphertext, optionally followed by a `;…` or `.…` trailer
///   appended by legacy upstreams, which is stripped before decoding.
///
/// Never panics on malformed input; callers probe keys by iterating.
pub fn decrypt(envelope: &str, keyword: &str, iv: &[u8; 16]) -> Option<String> {
    let trimmed = envelope.trim();

    if trimmed.starts_with(XML_SENTINEL) {
        return Some(trimmed.to_string());
    }

    let body = match trimmed.find([';', '.']) {
        Some(idx) => &trimmed[..idx],
        None => trimmed,
    };

    let mut data = STANDARD.decode(body).ok()?;
    if data.is_empty() || data.len() % BLOCK != 0 {
        return None;
    }

    let key = derive_key(keyword);
    let plain = Aes128CbcDec::new(&key.into(), iv.into())
        .decrypt_padded::<NoPadding>(&mut data)
        .ok()?;

    let start = plain.iter().position(|&b| b != 0)?;
    let end = plain.iter().rposition(|&b| b != 0)? + 1;
    let text = std::str::from_utf8(&plain[start..end]).ok()?.trim();

    if text.starts_with(XML_SENTINEL) {
        Some(text.to_string())
    } else {
        None
    }
}

/// Probes `keywords` in order and returns the first successful plaintext.
pub fn decrypt_with_any<'a, I>(envelope: &str, keywords: I, iv: &[u8; 16]) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    keywords
        .into_iter()
        .find_map(|keyword| decrypt(envelope, keyword, iv))
}
