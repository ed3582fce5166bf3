/// Characters per chunk of a decomposed key.
pub const CHUNK_WIDTH: usize = 2;

/// Prepended to keys whose character count is not a multiple of
/// [`CHUNK_WIDTH`].
pub const PAD_CHAR: char = '_';

/// Splits `key` into fixed-width chunks, left-padding with [`PAD_CHAR`] so
/// every chunk has exactly [`CHUNK_WIDTH`] characters. The empty key yields
/// no chunks.
///
/// Padding makes `"1"` and `"_1"` decompose identically.
#[must_use]
pub fn decompose_key(key: &str) -> Vec<String> {
    let len = key.chars().count();
    let pad = (CHUNK_WIDTH - len % CHUNK_WIDTH) % CHUNK_WIDTH;

    let mut chars = Vec::with_capacity(len + pad);
    chars.extend(std::iter::repeat_n(PAD_CHAR, pad));
    chars.extend(key.chars());

    chars
        .chunks(CHUNK_WIDTH)
        .map(|chunk| chunk.iter().collect())
        .collect()
}
