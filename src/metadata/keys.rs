//! Key layout shared by the metadata and inode trees
//!
//! Every key starts with `layer!` so that each layer is a contiguous range
//! of its tree. Integers are written with an order-preserving variable
//! length encoding, hex encoded, so byte order matches numeric order.

/// Separator between key components
pub const SEP: u8 = b'!';

/// Largest byte; never appears in UTF-8 path text
pub const KEY_END: u8 = 0xff;

/// Order-preserving integer encoding.
///
/// Values below 251 take one byte. Larger values take a tag byte
/// (251..=255) followed by 1, 2, 3, 4 or 8 big-endian bytes of `n - 251`.
pub fn lexint_pack(n: u64) -> Vec<u8> {
    if n < 251 {
        return vec![n as u8];
    }

    let rest = n - 251;
    let (tag, width) = if rest < 1 << 8 {
        (251u8, 1)
    } else if rest < 1 << 16 {
        (252, 2)
    } else if rest < 1 << 24 {
        (253, 3)
    } else if rest < 1 << 32 {
        (254, 4)
    } else {
        (255, 8)
    };

    let mut out = Vec::with_capacity(1 + width);
    out.push(tag);
    out.extend_from_slice(&rest.to_be_bytes()[8 - width..]);
    out
}

/// Inverse of [`lexint_pack`]
pub fn lexint_unpack(bytes: &[u8]) -> Option<u64> {
    let (&tag, rest) = bytes.split_first()?;
    let width = match tag {
        0..=250 => return rest.is_empty().then_some(tag as u64),
        251 => 1,
        252 => 2,
        253 => 3,
        254 => 4,
        255 => 8,
    };

    if rest.len() != width {
        return None;
    }

    let mut buf = [0u8; 8];
    buf[8 - width..].copy_from_slice(rest);
    u64::from_be_bytes(buf).checked_add(251)
}

/// Hex form of [`lexint_pack`], as stored in keys
pub fn lexint_hex(n: u64) -> String {
    hex::encode(lexint_pack(n))
}

/// Parse the hex form produced by [`lexint_hex`]
pub fn lexint_from_hex(s: &[u8]) -> Option<u64> {
    let bytes = hex::decode(s).ok()?;
    lexint_unpack(&bytes)
}

/// Number of `/` separators in a path
pub fn depth(path: &str) -> u64 {
    path.bytes().filter(|b| *b == b'/').count() as u64
}

/// Depth-prefixed index key: `hex(depth)!path`.
///
/// A directory written with a trailing slash gets the same depth as its
/// direct children, which is what makes child scans a single range.
pub fn index_key(path: &str) -> String {
    format!("{}!{}", lexint_hex(depth(path)), path)
}

/// `layer!` prefix shared by all keys of a layer
pub fn layer_prefix(layer: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(layer.len() + 1);
    key.extend_from_slice(layer.as_bytes());
    key.push(SEP);
    key
}

/// Metadata key for `path` in `layer`
pub fn entry_key(layer: &str, path: &str) -> Vec<u8> {
    let mut key = layer_prefix(layer);
    key.extend_from_slice(index_key(path).as_bytes());
    key
}

/// Inode key for `ino` in `layer`
pub fn inode_key(layer: &str, ino: u64) -> Vec<u8> {
    let mut key = layer_prefix(layer);
    key.extend_from_slice(lexint_hex(ino).as_bytes());
    key
}

/// Exclusive upper bound for every key starting with `prefix`
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    end.push(KEY_END);
    end
}

/// Key with its layer component stripped, used to line up keys across layers
pub fn compare_key(key: &[u8]) -> &[u8] {
    match key.iter().position(|b| *b == SEP) {
        Some(i) => &key[i + 1..],
        None => key,
    }
}

/// Path component of a metadata key
pub fn path_of_key(key: &[u8]) -> Option<&str> {
    let rest = compare_key(key);
    let i = rest.iter().position(|b| *b == SEP)?;
    std::str::from_utf8(&rest[i + 1..]).ok()
}

/// Directory form used for child scans: always ends with `/`
pub fn dir_scan_path(dir: &str) -> String {
    if dir.ends_with('/') {
        dir.to_string()
    } else {
        format!("{}/", dir)
    }
}

/// Join a directory path and a child name
pub fn child_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Last component of a path
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}
