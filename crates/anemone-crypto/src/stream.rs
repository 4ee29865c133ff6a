//! Authenticated stream encryption with a per-user data key
//!
//! [`encrypt_stream`] writes the single-unit format: a fresh random nonce
//! followed by the AES-256-GCM ciphertext of the whole input. The entire
//! payload is authenticated as one unit, so the input is buffered.
//!
//! [`encrypt_stream_chunked`] writes the `AECG` format for inputs too large to
//! buffer. [`decrypt_stream`] accepts both, detecting the magic prefix.
//!
//! Every decryption failure (wrong key, truncation, tampering, garbled
//! framing) surfaces as [`CryptoError::Authentication`].

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::DataKey;
use crate::{CHUNK_FORMAT_VERSION, CHUNK_MAGIC, NONCE_SIZE, TAG_SIZE};

/// Encrypt everything `reader` yields into `writer` as `[nonce][ciphertext + tag]`.
pub fn encrypt_stream<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    key: &DataKey,
) -> CryptoResult<()> {
    let mut plaintext = Vec::new();
    reader.read_to_end(&mut plaintext)?;
    let sealed = seal(key, &plaintext)?;
    writer.write_all(&sealed)?;
    writer.flush()?;
    Ok(())
}

/// Encrypt `reader` in independently authenticated chunks of `chunk_size` plaintext bytes.
///
/// Every frame is bound to its position and to whether it ends the stream, so
/// dropped, reordered or appended frames fail authentication. An empty input
/// still yields one (empty) final frame.
pub fn encrypt_stream_chunked<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    key: &DataKey,
    chunk_size: usize,
) -> CryptoResult<()> {
    if chunk_size == 0 {
        return Err(CryptoError::InvalidInput("chunk size must be positive"));
    }
    if chunk_size > u32::MAX as usize - TAG_SIZE {
        return Err(CryptoError::InvalidInput("chunk size exceeds the u32 frame length"));
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    writer.write_all(CHUNK_MAGIC)?;
    writer.write_all(&CHUNK_FORMAT_VERSION.to_be_bytes())?;

    // One chunk of lookahead tells us which frame is the last.
    let mut current = vec![0u8; chunk_size];
    let mut next = vec![0u8; chunk_size];
    let mut n = read_full(&mut reader, &mut current)?;
    let mut index = 0u64;
    loop {
        let (last, next_n) = if n < chunk_size {
            (true, 0)
        } else {
            let m = read_full(&mut reader, &mut next)?;
            (m == 0, m)
        };

        write_frame(&mut writer, &cipher, index, last, &current[..n])?;
        if last {
            break;
        }
        std::mem::swap(&mut current, &mut next);
        n = next_n;
        index += 1;
    }

    writer.flush()?;
    Ok(())
}

/// Decrypt either stream format from `reader` into `writer`.
///
/// The chunked format is decrypted frame by frame, so memory stays bounded by
/// one chunk. Plaintext of already-authenticated frames may have been written
/// before a later frame fails; callers writing to disk should write to a
/// temporary path and discard it on error.
pub fn decrypt_stream<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    key: &DataKey,
) -> CryptoResult<()> {
    let mut head = [0u8; 4];
    let n = read_full(&mut reader, &mut head)?;
    if n < head.len() {
        return Err(CryptoError::Authentication);
    }

    if &head == CHUNK_MAGIC {
        let cipher = Aes256Gcm::new(key.as_bytes().into());

        // A single-unit nonce can start with the magic too. Keep the bytes
        // consumed up to the first frame so that reading can be retried.
        let mut recorder = Recorder {
            inner: &mut reader,
            seen: Vec::new(),
        };
        let first = read_chunk_header(&mut recorder)
            .and_then(|()| read_frame(&mut recorder, &cipher, 0));
        let seen = recorder.seen;

        match first {
            Ok(Some((plaintext, last))) => {
                drop(seen);
                writer.write_all(&plaintext)?;
                if !last {
                    decrypt_frames(&mut reader, &mut writer, &cipher, 1)?;
                }
                expect_eof(&mut reader)?;
            }
            Ok(None) => return Err(CryptoError::Authentication),
            Err(chunked_err) => {
                let mut whole = Vec::with_capacity(head.len() + seen.len());
                whole.extend_from_slice(&head);
                whole.extend_from_slice(&seen);
                reader.read_to_end(&mut whole)?;
                match open(key, &whole) {
                    Ok(plaintext) => writer.write_all(&plaintext)?,
                    Err(_) => return Err(chunked_err),
                }
            }
        }
    } else {
        let mut whole = head.to_vec();
        reader.read_to_end(&mut whole)?;
        writer.write_all(&open(key, &whole)?)?;
    }

    writer.flush()?;
    Ok(())
}

/// Encrypt a byte slice in the single-unit format.
pub fn encrypt_bytes(plaintext: &[u8], key: &DataKey) -> CryptoResult<Vec<u8>> {
    seal(key, plaintext)
}

/// Decrypt either stream format held entirely in memory.
pub fn decrypt_bytes(encrypted: &[u8], key: &DataKey) -> CryptoResult<Vec<u8>> {
    let mut out = Vec::with_capacity(encrypted.len().saturating_sub(NONCE_SIZE + TAG_SIZE));
    decrypt_stream(encrypted, &mut out, key)?;
    Ok(out)
}

/// Encrypt the file at `src` into `dst` (chunked format).
pub fn encrypt_file(src: &Path, dst: &Path, key: &DataKey, chunk_size: usize) -> CryptoResult<()> {
    let input = std::io::BufReader::new(std::fs::File::open(src)?);
    let output = std::io::BufWriter::new(std::fs::File::create(dst)?);
    encrypt_stream_chunked(input, output, key, chunk_size)
}

/// Decrypt the file at `src` into `dst`.
///
/// Plaintext is streamed into a temporary file next to `dst`, which only
/// replaces `dst` once the whole input authenticates.
pub fn decrypt_file(src: &Path, dst: &Path, key: &DataKey) -> CryptoResult<()> {
    let input = std::io::BufReader::new(std::fs::File::open(src)?);
    let parent = match dst.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp = tempfile::NamedTempFile::new_in(parent)?;
    {
        let mut output = std::io::BufWriter::new(tmp.as_file());
        decrypt_stream(input, &mut output, key)?;
    }
    tmp.persist(dst).map_err(|e| CryptoError::Io(e.error))?;
    Ok(())
}

/// Magic already consumed; check the version that follows it.
fn read_chunk_header<R: Read>(reader: &mut R) -> CryptoResult<()> {
    let mut version = [0u8; 4];
    if read_full(reader, &mut version)? < version.len() {
        return Err(CryptoError::Authentication);
    }
    let version = u32::from_be_bytes(version);
    if version != CHUNK_FORMAT_VERSION {
        return Err(CryptoError::UnsupportedVersion(version));
    }
    Ok(())
}

/// Decrypt frames starting at `index` until the final frame.
fn decrypt_frames<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    cipher: &Aes256Gcm,
    mut index: u64,
) -> CryptoResult<()> {
    loop {
        match read_frame(reader, cipher, index)? {
            Some((plaintext, last)) => {
                writer.write_all(&plaintext)?;
                if last {
                    return Ok(());
                }
                index += 1;
            }
            // Clean EOF without a final frame: truncated at a frame boundary.
            None => return Err(CryptoError::Authentication),
        }
    }
}

fn write_frame<W: Write>(
    writer: &mut W,
    cipher: &Aes256Gcm,
    index: u64,
    last: bool,
    plaintext: &[u8],
) -> CryptoResult<()> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let flag = u8::from(last);
    let aad = frame_aad(index, flag);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| CryptoError::Authentication)?;

    writer.write_all(&[flag])?;
    writer.write_all(&(ciphertext.len() as u32).to_be_bytes())?;
    writer.write_all(&nonce_bytes)?;
    writer.write_all(&ciphertext)?;
    Ok(())
}

/// Read and authenticate one frame. `None` means EOF before any header byte.
fn read_frame<R: Read>(
    reader: &mut R,
    cipher: &Aes256Gcm,
    index: u64,
) -> CryptoResult<Option<(Vec<u8>, bool)>> {
    let mut header = [0u8; 5];
    match read_full(reader, &mut header)? {
        0 => return Ok(None),
        5 => {}
        _ => return Err(CryptoError::Authentication),
    }
    let flag = header[0];
    if flag > 1 {
        return Err(CryptoError::Authentication);
    }
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len < TAG_SIZE {
        return Err(CryptoError::Authentication);
    }

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    if read_full(reader, &mut nonce_bytes)? < NONCE_SIZE {
        return Err(CryptoError::Authentication);
    }

    let mut ciphertext = Vec::new();
    (&mut *reader).take(len as u64).read_to_end(&mut ciphertext)?;
    if ciphertext.len() < len {
        return Err(CryptoError::Authentication);
    }

    let aad = frame_aad(index, flag);
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| CryptoError::Authentication)?;
    Ok(Some((plaintext, flag == 1)))
}

/// AAD = frame index (8 bytes BE) || final-frame flag
fn frame_aad(index: u64, flag: u8) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = flag;
    aad
}

fn expect_eof<R: Read>(reader: &mut R) -> CryptoResult<()> {
    let mut extra = [0u8; 1];
    if read_full(reader, &mut extra)? != 0 {
        return Err(CryptoError::Authentication);
    }
    Ok(())
}

/// Passes reads through while keeping a copy of every byte.
struct Recorder<'a, R> {
    inner: &'a mut R,
    seen: Vec<u8>,
}

impl<R: Read> Read for Recorder<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.seen.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

fn seal(key: &DataKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::Authentication)?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

fn open(key: &DataKey, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Authentication);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Authentication)
}

/// Fill `buf` as far as the reader allows; returns bytes read (short only at EOF).
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
