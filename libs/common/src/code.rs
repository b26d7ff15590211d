use rand::Rng;

/// Characters allowed in join codes and room IDs. Ambiguous glyphs
/// (`b`, `i`, `l`, `o`, `0`, `1`, `8`) are excluded so codes survive
/// being read aloud or typed from memory.
pub const CODE_ALPHABET: &[u8] = b"acdefghjkmnpqrstuvwxyz2345679";

/// Length of one code segment.
pub const CODE_LEN: usize = 4;

fn code_segment<R: Rng>(rng: &mut R) -> String {
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Generates a short join code, e.g. `"xk4m"`.
pub fn generate_join_code() -> String {
    code_segment(&mut rand::thread_rng())
}

/// Generates a room ID of the form `xxxx-xxxx`, e.g. `"xk4m-p7qa"`.
pub fn generate_room_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{}-{}", code_segment(&mut rng), code_segment(&mut rng))
}

fn is_code_segment(s: &str) -> bool {
    s.len() == CODE_LEN
        && s
            .bytes()
            .all(|b| CODE_ALPHABET.contains(&b.to_ascii_lowercase()))
}

/// Returns true if `code` has the shape of a join code. Matching is
/// case-insensitive since codes are entered by hand.
pub fn is_valid_join_code(code: &str) -> bool {
    is_code_segment(code)
}

/// Returns true if `room` has the shape of a room ID (`xxxx-xxxx`).
pub fn is_valid_room_id(room: &str) -> bool {
    match room.split_once('-') {
        Some((first, second)) => is_code_segment(first) && is_code_segment(second),
        None => false,
    }
}
