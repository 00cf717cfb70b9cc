//! ISO-9660 image writer and reader
//!
//! Writes ISO-9660 with interchange level 2 identifiers plus Rock Ridge
//! (SUSP `SP`/`ER`, RRIP `PX`/`NM`) so the mounted drive shows the real file
//! names, case and punctuation included. Names that are not valid d-characters
//! are mapped for the plain identifier (`2012-08-10` is stored as
//! `2012_08_10`, `user_data` as `USER_DATA.;1`) and kept intact in the `NM`
//! entry. Every timestamp is left unset, which makes the image a pure function
//! of the directory tree.
//!
//! The reader only understands images laid out like the ones written here.
//! It exists to inspect built drives, not to mount arbitrary media.

use std::collections::{BTreeMap, VecDeque};

use crate::DeployError;

/// Logical sector size
pub const SECTOR_SIZE: usize = 2048;

/// First volume descriptor sector, after the system area
const DESCRIPTOR_START: usize = 16;

const STANDARD_ID: &[u8] = b"CD001";

/// Level 2 limit on identifier length (name + '.' + extension)
const MAX_IDENTIFIER_LEN: usize = 30;

/// ISO-9660 allows at most eight directory levels
const MAX_DEPTH: usize = 8;

const FLAG_DIRECTORY: u8 = 0x02;

const APPLICATION_ID: &str = "BAREMETAL-DEPLOY";

/// SUSP indicator at the start of the root `.` record
const SP_ENTRY: [u8; 7] = [b'S', b'P', 7, 1, 0xBE, 0xEF, 0];

const RRIP_ID: &str = "RRIP_1991A";
const RRIP_DESCRIPTOR: &str = "ROCK RIDGE INTERCHANGE PROTOCOL";

const PX_LEN: u8 = 36;
const DIR_MODE: u32 = 0o040555;
const FILE_MODE: u32 = 0o100444;

/// `NM` flags
const NM_CONTINUE: u8 = 0x01;
const NM_CURRENT: u8 = 0x02;
const NM_PARENT: u8 = 0x04;

/// In-memory directory tree, keyed by real file names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeMap<String, Directory>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the directory at a slash separated path
    pub fn dir_mut(&mut self, path: &str) -> &mut Directory {
        path.split('/')
            .filter(|p| !p.is_empty())
            .fold(self, |dir, part| dir.dirs.entry(part.to_string()).or_default())
    }

    /// Insert a file, creating parent directories as needed
    pub fn insert_file(&mut self, path: &str, contents: Vec<u8>) {
        let (parent, name) = path.rsplit_once('/').unwrap_or(("", path));
        self.dir_mut(parent).files.insert(name.to_string(), contents);
    }

    /// Contents of the file at a slash separated path
    pub fn file(&self, path: &str) -> Option<&[u8]> {
        let (parent, name) = path.rsplit_once('/').unwrap_or(("", path));
        let mut dir = self;
        for part in parent.split('/').filter(|p| !p.is_empty()) {
            dir = dir.dirs.get(part)?;
        }
        dir.files.get(name).map(Vec::as_slice)
    }

    /// Every file path in the tree with its size, sorted
    pub fn list(&self) -> Vec<(String, usize)> {
        let mut out = Vec::new();
        self.collect("", &mut out);
        out.sort();
        out
    }

    fn collect(&self, prefix: &str, out: &mut Vec<(String, usize)>) {
        for (name, data) in &self.files {
            out.push((format!("{}{}", prefix, name), data.len()));
        }
        for (name, dir) in &self.dirs {
            dir.collect(&format!("{}{}/", prefix, name), out);
        }
    }
}

// ==================== Writer ====================

#[derive(Clone, Copy)]
enum EntryKind {
    Dir(usize),
    File(usize),
}

struct Entry {
    identifier: Vec<u8>,
    name: String,
    kind: EntryKind,
}

struct PlannedDir {
    identifier: Vec<u8>,
    parent: usize,
    entries: Vec<Entry>,
    lba: usize,
    size: usize,
}

impl PlannedDir {
    fn new(identifier: Vec<u8>, parent: usize) -> Self {
        Self {
            identifier,
            parent,
            entries: Vec::new(),
            lba: 0,
            size: 0,
        }
    }

    /// Link count: `.`, the entry in the parent, and one `..` per subdirectory
    fn nlink(&self) -> u32 {
        let subdirs = self
            .entries
            .iter()
            .filter(|e| matches!(e.kind, EntryKind::Dir(_)))
            .count();
        2 + subdirs as u32
    }
}

struct PlannedFile<'a> {
    data: &'a [u8],
    lba: usize,
}

/// One record of a directory extent, before block addresses are known
struct DirRecord {
    identifier: Vec<u8>,
    system_use: Vec<u8>,
    kind: EntryKind,
}

impl DirRecord {
    fn len(&self) -> usize {
        record_len(self.identifier.len(), self.system_use.len())
    }
}

/// Pack a directory tree into an ISO-9660 image
pub fn write_image(root: &Directory, volume_id: &str) -> Result<Vec<u8>, DeployError> {
    if volume_id.len() > 32 || !volume_id.is_ascii() {
        return Err(DeployError::Build(format!(
            "invalid volume identifier '{}'",
            volume_id
        )));
    }

    let (mut dirs, mut files) = plan(root)?;
    let records: Vec<Vec<DirRecord>> = (0..dirs.len()).map(|i| dir_records(&dirs, i)).collect();

    // Layout: system area, PVD, terminator, L and M path tables, directory
    // extents in path table order, then file data.
    let path_table_len = path_table_size(&dirs);
    let path_table_sectors = path_table_len.div_ceil(SECTOR_SIZE);
    let l_table_lba = DESCRIPTOR_START + 2;
    let m_table_lba = l_table_lba + path_table_sectors;
    let mut next = m_table_lba + path_table_sectors;

    for (dir, records) in dirs.iter_mut().zip(&records) {
        dir.lba = next;
        dir.size = extent_size(records);
        next += dir.size / SECTOR_SIZE;
    }
    for file in files.iter_mut() {
        if file.data.len() > u32::MAX as usize {
            return Err(DeployError::Build("file too large for ISO-9660".to_string()));
        }
        file.lba = next;
        next += file.data.len().div_ceil(SECTOR_SIZE);
    }

    let total_sectors = next;
    if total_sectors > u32::MAX as usize / SECTOR_SIZE {
        return Err(DeployError::Build("image too large for ISO-9660".to_string()));
    }

    let mut image = vec![0u8; total_sectors * SECTOR_SIZE];

    let pvd = primary_descriptor(
        volume_id,
        total_sectors,
        path_table_len,
        l_table_lba,
        m_table_lba,
        &dirs[0],
    );
    place(&mut image, DESCRIPTOR_START, &pvd);
    place(&mut image, DESCRIPTOR_START + 1, &terminator());

    place(&mut image, l_table_lba, &path_table(&dirs, false));
    place(&mut image, m_table_lba, &path_table(&dirs, true));

    for (dir, records) in dirs.iter().zip(&records) {
        let mut extent = Vec::with_capacity(dir.size);
        for record in records {
            let (lba, size, is_dir) = match record.kind {
                EntryKind::Dir(i) => (dirs[i].lba, dirs[i].size, true),
                EntryKind::File(i) => (files[i].lba, files[i].data.len(), false),
            };
            let encoded = encode_record(&record.identifier, lba, size, is_dir, &record.system_use);
            if extent.len() % SECTOR_SIZE + encoded.len() > SECTOR_SIZE {
                extent.resize(extent.len().next_multiple_of(SECTOR_SIZE), 0);
            }
            extent.extend_from_slice(&encoded);
        }
        place(&mut image, dir.lba, &extent);
    }

    for file in &files {
        place(&mut image, file.lba, file.data);
    }

    Ok(image)
}

/// Walk the tree breadth first, assigning directory numbers in path table order
fn plan(root: &Directory) -> Result<(Vec<PlannedDir>, Vec<PlannedFile<'_>>), DeployError> {
    let mut dirs = vec![PlannedDir::new(vec![0], 0)];
    let mut files = Vec::new();
    let mut queue = VecDeque::from([(0usize, root, 1usize)]);

    while let Some((index, source, depth)) = queue.pop_front() {
        if depth > MAX_DEPTH {
            return Err(DeployError::Build(format!(
                "directory tree deeper than {} levels",
                MAX_DEPTH
            )));
        }

        let mut subdirs = source
            .dirs
            .iter()
            .map(|(name, dir)| Ok((dir_identifier(name)?, name, dir)))
            .collect::<Result<Vec<_>, DeployError>>()?;
        subdirs.sort_by(|a, b| a.0.cmp(&b.0));

        let mut entries = Vec::new();
        for (identifier, name, dir) in subdirs {
            let child = dirs.len();
            dirs.push(PlannedDir::new(identifier.clone(), index));
            queue.push_back((child, dir, depth + 1));
            entries.push(Entry {
                identifier,
                name: name.clone(),
                kind: EntryKind::Dir(child),
            });
        }

        for (name, data) in &source.files {
            files.push(PlannedFile { data, lba: 0 });
            entries.push(Entry {
                identifier: file_identifier(name)?,
                name: name.clone(),
                kind: EntryKind::File(files.len() - 1),
            });
        }

        entries.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        if let Some(pair) = entries.windows(2).find(|w| w[0].identifier == w[1].identifier) {
            return Err(DeployError::Build(format!(
                "name collision between '{}' and '{}' on '{}'",
                pair[0].name,
                pair[1].name,
                String::from_utf8_lossy(&pair[0].identifier)
            )));
        }

        dirs[index].entries = entries;
    }

    Ok((dirs, files))
}

fn is_d_char(b: u8) -> bool {
    b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_'
}

/// Upper-case a name and replace anything outside the d-characters with `_`
fn d_chars(name: &str) -> Vec<u8> {
    name.bytes()
        .map(|b| b.to_ascii_uppercase())
        .map(|b| if is_d_char(b) { b } else { b'_' })
        .collect()
}

/// Reject names a Rock Ridge `NM` entry cannot carry
fn check_name(name: &str, kind: &str) -> Result<(), DeployError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_IDENTIFIER_LEN
        && name != "."
        && name != ".."
        && !name.bytes().any(|b| b == b'/' || b == 0);

    if valid {
        Ok(())
    } else {
        Err(DeployError::Build(format!(
            "{} name '{}' cannot be stored on the image",
            kind, name
        )))
    }
}

fn dir_identifier(name: &str) -> Result<Vec<u8>, DeployError> {
    check_name(name, "directory")?;
    Ok(d_chars(name))
}

fn file_identifier(name: &str) -> Result<Vec<u8>, DeployError> {
    check_name(name, "file")?;
    let (stem, ext) = name.rsplit_once('.').unwrap_or((name, ""));

    let mut identifier = d_chars(stem);
    identifier.push(b'.');
    identifier.extend(d_chars(ext));
    identifier.extend_from_slice(b";1");
    Ok(identifier)
}

/// Length of a directory record, padded to an even size
fn record_len(identifier_len: usize, system_use_len: usize) -> usize {
    let len = 33 + identifier_len + (identifier_len + 1) % 2 + system_use_len;
    len + len % 2
}

/// Size of a directory extent; records never straddle a sector
fn extent_size(records: &[DirRecord]) -> usize {
    let mut offset = 0;
    for len in records.iter().map(DirRecord::len) {
        if offset % SECTOR_SIZE + len > SECTOR_SIZE {
            offset = offset.next_multiple_of(SECTOR_SIZE);
        }
        offset += len;
    }
    offset.div_ceil(SECTOR_SIZE) * SECTOR_SIZE
}

/// Records of one directory: `.`, `..`, then the entries
fn dir_records(dirs: &[PlannedDir], index: usize) -> Vec<DirRecord> {
    let dir = &dirs[index];
    let parent = &dirs[dir.parent];

    let mut dot = Vec::new();
    if index == 0 {
        dot.extend_from_slice(&SP_ENTRY);
    }
    dot.extend(px_entry(DIR_MODE, dir.nlink()));
    if index == 0 {
        dot.extend(er_entry());
    }

    let mut records = vec![
        DirRecord {
            identifier: vec![0],
            system_use: dot,
            kind: EntryKind::Dir(index),
        },
        DirRecord {
            identifier: vec![1],
            system_use: px_entry(DIR_MODE, parent.nlink()),
            kind: EntryKind::Dir(dir.parent),
        },
    ];

    for entry in &dir.entries {
        let mut system_use = match entry.kind {
            EntryKind::Dir(i) => px_entry(DIR_MODE, dirs[i].nlink()),
            EntryKind::File(_) => px_entry(FILE_MODE, 1),
        };
        system_use.extend(nm_entry(&entry.name));
        records.push(DirRecord {
            identifier: entry.identifier.clone(),
            system_use,
            kind: entry.kind,
        });
    }
    records
}

/// RRIP `PX`: POSIX mode and link count, owned by root
fn px_entry(mode: u32, nlink: u32) -> Vec<u8> {
    let mut entry = vec![0u8; PX_LEN as usize];
    entry[..4].copy_from_slice(&[b'P', b'X', PX_LEN, 1]);
    both_u32(&mut entry[4..12], mode);
    both_u32(&mut entry[12..20], nlink);
    // 20..36: uid and gid, both zero
    entry
}

/// RRIP `NM`: the real name, in a single entry
fn nm_entry(name: &str) -> Vec<u8> {
    let mut entry = vec![b'N', b'M', (5 + name.len()) as u8, 1, 0];
    entry.extend_from_slice(name.as_bytes());
    entry
}

/// SUSP `ER`: announces the Rock Ridge extension
fn er_entry() -> Vec<u8> {
    let (id, descriptor, source) = (RRIP_ID, RRIP_DESCRIPTOR, APPLICATION_ID);
    let len = 8 + id.len() + descriptor.len() + source.len();

    let mut entry = vec![
        b'E',
        b'R',
        len as u8,
        1,
        id.len() as u8,
        descriptor.len() as u8,
        source.len() as u8,
        1,
    ];
    entry.extend_from_slice(id.as_bytes());
    entry.extend_from_slice(descriptor.as_bytes());
    entry.extend_from_slice(source.as_bytes());
    entry
}

fn both_u16(out: &mut [u8], value: u16) {
    out[..2].copy_from_slice(&value.to_le_bytes());
    out[2..4].copy_from_slice(&value.to_be_bytes());
}

fn both_u32(out: &mut [u8], value: u32) {
    out[..4].copy_from_slice(&value.to_le_bytes());
    out[4..8].copy_from_slice(&value.to_be_bytes());
}

fn encode_record(
    identifier: &[u8],
    lba: usize,
    size: usize,
    is_dir: bool,
    system_use: &[u8],
) -> Vec<u8> {
    let len = record_len(identifier.len(), system_use.len());
    let mut record = vec![0u8; len];
    record[0] = len as u8;
    both_u32(&mut record[2..10], lba as u32);
    both_u32(&mut record[10..18], size as u32);
    // 18..25: recording date, left unset
    record[25] = if is_dir { FLAG_DIRECTORY } else { 0 };
    both_u16(&mut record[28..32], 1);
    record[32] = identifier.len() as u8;
    record[33..33 + identifier.len()].copy_from_slice(identifier);

    let su_start = 33 + identifier.len() + (identifier.len() + 1) % 2;
    record[su_start..su_start + system_use.len()].copy_from_slice(system_use);
    record
}

fn path_table_size(dirs: &[PlannedDir]) -> usize {
    dirs.iter()
        .map(|d| 8 + d.identifier.len() + d.identifier.len() % 2)
        .sum()
}

/// Path table in directory number order; `lba` fields must already be final
fn path_table(dirs: &[PlannedDir], big_endian: bool) -> Vec<u8> {
    let mut table = Vec::new();
    for dir in dirs {
        let id_len = dir.identifier.len();
        table.push(id_len as u8);
        table.push(0);
        let (lba, parent) = (dir.lba as u32, (dir.parent + 1) as u16);
        if big_endian {
            table.extend_from_slice(&lba.to_be_bytes());
            table.extend_from_slice(&parent.to_be_bytes());
        } else {
            table.extend_from_slice(&lba.to_le_bytes());
            table.extend_from_slice(&parent.to_le_bytes());
        }
        table.extend_from_slice(&dir.identifier);
        if id_len % 2 == 1 {
            table.push(0);
        }
    }
    table
}

fn pad_str(out: &mut [u8], value: &str) {
    out.fill(b' ');
    out[..value.len()].copy_from_slice(value.as_bytes());
}

fn primary_descriptor(
    volume_id: &str,
    total_sectors: usize,
    path_table_size: usize,
    l_table_lba: usize,
    m_table_lba: usize,
    root: &PlannedDir,
) -> Vec<u8> {
    let mut d = vec![0u8; SECTOR_SIZE];
    d[0] = 1;
    d[1..6].copy_from_slice(STANDARD_ID);
    d[6] = 1;
    pad_str(&mut d[8..40], "");
    pad_str(&mut d[40..72], volume_id);
    both_u32(&mut d[80..88], total_sectors as u32);
    both_u16(&mut d[120..124], 1);
    both_u16(&mut d[124..128], 1);
    both_u16(&mut d[128..132], SECTOR_SIZE as u16);
    both_u32(&mut d[132..140], path_table_size as u32);
    d[140..144].copy_from_slice(&(l_table_lba as u32).to_le_bytes());
    d[148..152].copy_from_slice(&(m_table_lba as u32).to_be_bytes());
    d[156..190].copy_from_slice(&encode_record(&[0], root.lba, root.size, true, &[]));
    pad_str(&mut d[190..318], "");
    pad_str(&mut d[318..446], "");
    pad_str(&mut d[446..574], "");
    pad_str(&mut d[574..702], APPLICATION_ID);
    pad_str(&mut d[702..813], "");
    // Creation, modification, expiration and effective dates: unset
    for start in [813, 830, 847, 864] {
        d[start..start + 16].fill(b'0');
    }
    d[881] = 1;
    d
}

fn terminator() -> Vec<u8> {
    let mut d = vec![0u8; SECTOR_SIZE];
    d[0] = 255;
    d[1..6].copy_from_slice(STANDARD_ID);
    d[6] = 1;
    d
}

fn place(image: &mut [u8], lba: usize, data: &[u8]) {
    let start = lba * SECTOR_SIZE;
    image[start..start + data.len()].copy_from_slice(data);
}

// ==================== Reader ====================

/// A parsed ISO-9660 image
#[derive(Debug, Clone)]
pub struct IsoImage {
    volume_id: String,
    rock_ridge: bool,
    root: Directory,
}

struct Record<'a> {
    lba: usize,
    size: usize,
    is_dir: bool,
    identifier: &'a [u8],
    system_use: &'a [u8],
}

impl IsoImage {
    /// Parse an image, loading every file into memory
    ///
    /// Names come from Rock Ridge `NM` entries when the root carries a SUSP
    /// `SP` indicator, and from the lower-cased identifiers otherwise.
    pub fn parse(image: &[u8]) -> Result<Self, DeployError> {
        let pvd = slice(image, DESCRIPTOR_START * SECTOR_SIZE, SECTOR_SIZE)?;
        if pvd[0] != 1 || &pvd[1..6] != STANDARD_ID {
            return Err(DeployError::Build(
                "no primary volume descriptor found".to_string(),
            ));
        }
        if u16::from_le_bytes([pvd[128], pvd[129]]) as usize != SECTOR_SIZE {
            return Err(DeployError::Build("unsupported logical block size".to_string()));
        }

        let volume_id = String::from_utf8_lossy(&pvd[40..72]).trim_end().to_string();
        let root = parse_record(&pvd[156..190])?;

        let root_extent = slice(image, root.lba * SECTOR_SIZE, root.size)?;
        let skip = susp_skip(parse_record(root_extent)?.system_use);
        let root = read_directory(image, root.lba, root.size, 0, skip)?;

        Ok(Self {
            volume_id,
            rock_ridge: skip.is_some(),
            root,
        })
    }

    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    /// Whether names were taken from Rock Ridge entries
    pub fn has_rock_ridge(&self) -> bool {
        self.rock_ridge
    }

    pub fn root(&self) -> &Directory {
        &self.root
    }

    /// Contents of a file, by its mounted path
    pub fn read(&self, path: &str) -> Option<&[u8]> {
        self.root.file(path)
    }
}

fn slice(image: &[u8], start: usize, len: usize) -> Result<&[u8], DeployError> {
    start
        .checked_add(len)
        .and_then(|end| image.get(start..end))
        .ok_or_else(|| DeployError::Build("extent lies outside the image".to_string()))
}

fn parse_record(bytes: &[u8]) -> Result<Record<'_>, DeployError> {
    let len = bytes.first().copied().unwrap_or(0) as usize;
    if len < 34 || len > bytes.len() {
        return Err(DeployError::Build("malformed directory record".to_string()));
    }

    let id_len = bytes[32] as usize;
    if 33 + id_len > len {
        return Err(DeployError::Build("malformed directory record".to_string()));
    }
    let su_start = (33 + id_len + (id_len + 1) % 2).min(len);

    Ok(Record {
        lba: u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize,
        size: u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]) as usize,
        is_dir: bytes[25] & FLAG_DIRECTORY != 0,
        identifier: &bytes[33..33 + id_len],
        system_use: &bytes[su_start..len],
    })
}

/// Bytes to skip in every system use area, if the root announces SUSP
fn susp_skip(root_system_use: &[u8]) -> Option<usize> {
    match root_system_use {
        [b'S', b'P', 7, 1, 0xBE, 0xEF, skip, ..] => Some(*skip as usize),
        _ => None,
    }
}

/// Real name from the `NM` entries of a system use area
///
/// Continuation areas (`CE`) are not followed.
fn rock_ridge_name(system_use: &[u8]) -> Option<String> {
    let mut name = Vec::new();
    let mut found = false;
    let mut offset = 0;

    while offset + 4 <= system_use.len() {
        let entry_len = system_use[offset + 2] as usize;
        if entry_len < 4 || offset + entry_len > system_use.len() {
            break;
        }
        let entry = &system_use[offset..offset + entry_len];
        offset += entry_len;

        match &entry[..2] {
            b"ST" => break,
            b"NM" if entry_len >= 5 => {
                let flags = entry[4];
                if flags & (NM_CURRENT | NM_PARENT) != 0 {
                    continue;
                }
                name.extend_from_slice(&entry[5..]);
                found = true;
                if flags & NM_CONTINUE == 0 {
                    break;
                }
            }
            _ => {}
        }
    }

    if found {
        String::from_utf8(name).ok().filter(|n| !n.is_empty())
    } else {
        None
    }
}

/// Map `NAME.EXT;1` to `name.ext` the way Linux does without Rock Ridge
fn mounted_name(identifier: &[u8]) -> String {
    let name = String::from_utf8_lossy(identifier);
    let name = name.split(';').next().unwrap_or_default();
    name.trim_end_matches('.').to_ascii_lowercase()
}

fn read_directory(
    image: &[u8],
    lba: usize,
    size: usize,
    depth: usize,
    skip: Option<usize>,
) -> Result<Directory, DeployError> {
    if depth >= MAX_DEPTH {
        return Err(DeployError::Build("directory tree too deep".to_string()));
    }

    let extent = slice(image, lba * SECTOR_SIZE, size)?;
    let mut dir = Directory::new();
    let mut offset = 0;

    while offset < extent.len() {
        let len = extent[offset] as usize;
        if len == 0 {
            // Rest of this sector is padding
            offset = (offset / SECTOR_SIZE + 1) * SECTOR_SIZE;
            continue;
        }

        let record = parse_record(&extent[offset..])?;
        offset += len;

        if matches!(record.identifier, [0] | [1]) {
            continue;
        }

        let name = skip
            .and_then(|skip| record.system_use.get(skip..))
            .and_then(rock_ridge_name)
            .unwrap_or_else(|| mounted_name(record.identifier));

        if record.is_dir {
            let child = read_directory(image, record.lba, record.size, depth + 1, skip)?;
            dir.dirs.insert(name, child);
        } else {
            let data = slice(image, record.lba * SECTOR_SIZE, record.size)?;
            dir.files.insert(name, data.to_vec());
        }
    }

    Ok(dir)
}
