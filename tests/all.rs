use std::fs::{self, File};
use std::io::prelude::*;
use std::io::Cursor;
use std::iter::repeat;
use std::path::Path;

use tempfile::TempDir;

use rustar::{Archive, Builder, EntryType, Format, Header};

macro_rules! t {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => panic!("{} returned {}", stringify!($e), e),
        }
    };
}

macro_rules! tar {
    ($e:expr) => {
        &include_bytes!(concat!("archives/", $e))[..]
    };
}

mod header;

#[test]
fn simple() {
    let mut ar = Archive::new(Cursor::new(tar!("directory.tar")));
    for entry in t!(ar.entries()) {
        t!(entry);
    }
    let mut ar = Archive::new(Cursor::new(tar!("directory.tar")));
    for entry in t!(ar.entries()) {
        t!(entry);
    }
}

#[test]
fn header_impls() {
    let mut ar = Archive::new(Cursor::new(tar!("directory.tar")));
    let hn = Header::new_old();
    let hnb = hn.as_bytes();
    for file in t!(ar.entries()) {
        let file = t!(file);
        let h1 = file.header();
        let h1b = h1.as_bytes();
        let h2 = h1.clone();
        let h2b = h2.as_bytes();
        assert!(h1b[..] == h2b[..] && h2b[..] != hnb[..])
    }
}

#[test]
fn reading_files() {
    let mut ar = Archive::new(Cursor::new(tar!("directory.tar")));
    let mut names = Vec::new();
    let mut contents = Vec::new();
    for entry in t!(ar.entries()) {
        let mut entry = t!(entry);
        names.push(String::from_utf8_lossy(&entry.path_bytes()).into_owned());
        let mut s = String::new();
        t!(entry.read_to_string(&mut s));
        contents.push(s);
    }
    assert_eq!(names, ["d/", "d/b/", "d/b/c.txt", "d/a.txt"]);
    assert_eq!(contents, ["", "", "", "hi\n\n"]);
}

#[test]
fn writing_files() {
    let mut ar = Builder::new(Vec::new());
    let td = t!(TempDir::new());

    let path = td.path().join("test");
    t!(t!(File::create(&path)).write_all(b"test"));

    t!(ar.append_file("test2", &mut t!(File::open(&path))));

    let data = t!(ar.into_inner());
    let mut ar = Archive::new(Cursor::new(data));
    let mut entries = t!(ar.entries());
    let mut f = t!(entries.next().unwrap());

    assert_eq!(&*f.path_bytes(), b"test2");
    assert_eq!(f.size(), 4);
    let mut s = String::new();
    t!(f.read_to_string(&mut s));
    assert_eq!(s, "test");

    assert!(entries.next().is_none());
}

#[test]
fn large_filename_gnu() {
    let mut ar = Builder::new(Vec::new());
    ar.set_format(Format::Gnu);

    let filename = repeat("abcd/").take(50).collect::<String>();
    let mut header = Header::new_gnu();
    header.set_size(4);
    header.set_mode(0o644);
    header.set_entry_type(EntryType::file());
    t!(ar.append_data(&mut header, &filename, &b"test"[..]));

    let data = t!(ar.into_inner());
    let mut ar = Archive::new(Cursor::new(data));
    let mut entries = t!(ar.entries());
    let mut f = t!(entries.next().unwrap());
    assert!(entries.next().is_none());

    assert_eq!(&*f.path_bytes(), filename.as_bytes());
    assert_eq!(f.size(), 4);
    let mut s = String::new();
    t!(f.read_to_string(&mut s));
    assert_eq!(s, "test");
}

#[test]
fn large_filename_pax() {
    let mut ar = Builder::new(Vec::new());
    ar.set_format(Format::Pax);

    // A single 200-byte component cannot be prefix-split, so the name
    // has to travel in a `path` record.
    let filename = "x".repeat(200);
    let mut header = Header::new_ustar();
    header.set_size(4);
    header.set_mode(0o644);
    header.set_entry_type(EntryType::file());
    t!(ar.append_data(&mut header, &filename, &b"test"[..]));

    let data = t!(ar.into_inner());
    let mut ar = Archive::new(Cursor::new(data));
    let mut entries = t!(ar.entries());
    let f = t!(entries.next().unwrap());
    assert!(entries.next().is_none());
    assert_eq!(&*f.path_bytes(), filename.as_bytes());
    assert!(f.pax_overrides().is_some());

    // A path with slashes splits across name and prefix instead, with
    // no extended records at all.
    let mut ar = Builder::new(Vec::new());
    ar.set_format(Format::Pax);
    let split_name = repeat("wxyz/").take(50).collect::<String>();
    let mut header = Header::new_ustar();
    header.set_size(4);
    header.set_mode(0o644);
    header.set_entry_type(EntryType::file());
    t!(ar.append_data(&mut header, &split_name, &b"test"[..]));
    let data = t!(ar.into_inner());
    let mut ar = Archive::new(Cursor::new(data));
    let mut entries = t!(ar.entries());
    let f = t!(entries.next().unwrap());
    assert_eq!(&*f.path_bytes(), split_name.as_bytes());
    assert!(f.pax_overrides().is_none());
}

#[test]
fn large_filename_rejected_by_strict_formats() {
    let long = repeat("abcd").take(200).collect::<String>();
    for format in [Format::V7, Format::Ustar] {
        let mut ar = Builder::new(Vec::new());
        ar.set_format(format);
        let mut header = Header::new(format);
        header.set_size(0);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::file());
        assert!(
            ar.append_data(&mut header, &long, &b""[..]).is_err(),
            "{} should reject long names",
            format
        );
    }
}

#[test]
#[cfg(unix)]
fn long_linkname_via_k_member() {
    let mut ar = Builder::new(Vec::new());
    ar.set_format(Format::Gnu);

    let target = repeat("link/").take(40).collect::<String>();
    let td = t!(TempDir::new());
    let path = td.path().join("s");
    t!(std::os::unix::fs::symlink(&target, &path));
    t!(ar.append_path_with_name(&path, Path::new("s")));

    let data = t!(ar.into_inner());
    let mut ar = Archive::new(Cursor::new(data));
    let mut entries = t!(ar.entries());
    let f = t!(entries.next().unwrap());
    assert!(f.header().entry_type().is_symlink());
    assert_eq!(&*f.link_name_bytes().unwrap(), target.as_bytes());
}

#[test]
fn reading_gnu_long_fixture() {
    let mut ar = Archive::new(Cursor::new(tar!("gnu-long.tar")));
    let mut entries = t!(ar.entries());
    let mut f = t!(entries.next().unwrap());
    let name = String::from_utf8_lossy(&f.path_bytes()).into_owned();
    assert_eq!(name.len(), 156);
    assert!(name.starts_with("very-long-directory-name-001/"));
    assert!(name.ends_with("/payload.txt"));
    let mut s = String::new();
    t!(f.read_to_string(&mut s));
    assert_eq!(s, "deep\n");
    assert!(entries.next().is_none());
}

#[test]
fn reading_pax_long_fixture() {
    let mut ar = Archive::new(Cursor::new(tar!("pax-long.tar")));
    let mut entries = t!(ar.entries());
    let mut f = t!(entries.next().unwrap());
    let name = String::from_utf8_lossy(&f.path_bytes()).into_owned();
    assert!(name.ends_with("/payload.txt"));
    let mut s = String::new();
    t!(f.read_to_string(&mut s));
    assert_eq!(s, "deep\n");
}

#[test]
fn reading_ustar_prefix_fixture() {
    let mut ar = Archive::new(Cursor::new(tar!("ustar.tar")));
    let mut entries = t!(ar.entries());
    let mut f = t!(entries.next().unwrap());
    assert_eq!(
        &*f.path_bytes(),
        b"prefix-part-one/prefix-part-two/numbers.txt"
    );
    let mut s = String::new();
    t!(f.read_to_string(&mut s));
    let expected: String = (1..=100).map(|n| format!("{}\n", n)).collect();
    assert_eq!(s, expected);
}

#[test]
fn reading_v7_fixture() {
    let mut ar = Archive::new(Cursor::new(tar!("v7.tar")));
    let mut entries = t!(ar.entries());
    let mut f = t!(entries.next().unwrap());
    assert_eq!(&*f.path_bytes(), b"old.txt");
    assert_eq!(f.header().format(), Format::V7);
    let mut s = String::new();
    t!(f.read_to_string(&mut s));
    assert_eq!(s, "seventies\n");
}

#[test]
fn reading_links_fixture() {
    let mut ar = Archive::new(Cursor::new(tar!("links.tar")));
    let mut entries = t!(ar.entries());

    let regular = t!(entries.next().unwrap());
    assert_eq!(&*regular.path_bytes(), b"t");
    assert!(regular.header().entry_type().is_file());

    let symlink = t!(entries.next().unwrap());
    assert_eq!(&*symlink.path_bytes(), b"s");
    assert!(symlink.header().entry_type().is_symlink());
    assert_eq!(&*symlink.link_name_bytes().unwrap(), b"t");

    let hard = t!(entries.next().unwrap());
    assert_eq!(&*hard.path_bytes(), b"hard");
    assert!(hard.header().entry_type().is_hard_link());
    assert_eq!(&*hard.link_name_bytes().unwrap(), b"t");
}

fn check_holey_contents(data: &[u8]) {
    assert_eq!(data.len(), 1024 * 1024);
    assert!(data[..4096].iter().all(|b| *b == b'A'));
    assert!(data[4096..512 * 1024].iter().all(|b| *b == 0));
    assert!(data[512 * 1024..512 * 1024 + 8192].iter().all(|b| *b == b'B'));
    assert!(data[512 * 1024 + 8192..].iter().all(|b| *b == 0));
}

#[test]
fn reading_pax_sparse_fixture() {
    let mut ar = Archive::new(Cursor::new(tar!("sparse-pax.tar")));
    let mut entries = t!(ar.entries());
    let mut f = t!(entries.next().unwrap());

    // The real name travels in GNU.sparse.name, not the header.
    assert_eq!(&*f.path_bytes(), b"holey.bin");
    assert_eq!(f.size(), 1024 * 1024);
    assert!(f.sparse_map().is_some());

    let mut data = Vec::new();
    t!(f.write_logical_to(&mut data));
    check_holey_contents(&data);
    assert!(entries.next().is_none());
}

#[test]
fn reading_oldgnu_sparse_fixture() {
    let mut ar = Archive::new(Cursor::new(tar!("sparse-oldgnu.tar")));
    let mut entries = t!(ar.entries());
    let mut f = t!(entries.next().unwrap());

    assert_eq!(&*f.path_bytes(), b"holey.bin");
    assert!(f.header().entry_type().is_gnu_sparse());
    assert_eq!(f.size(), 1024 * 1024);

    let mut data = Vec::new();
    t!(f.write_logical_to(&mut data));
    check_holey_contents(&data);
}

#[test]
fn sparse_round_trip_through_builder() {
    let td = t!(TempDir::new());
    let path = td.path().join("holey");
    {
        let mut f = t!(File::create(&path));
        t!(f.write_all(&vec![7u8; 1000]));
        t!(f.seek(std::io::SeekFrom::Start(700 * 1024)));
        t!(f.write_all(&vec![9u8; 2000]));
        t!(f.set_len(1024 * 1024));
    }

    let mut ar = Builder::new(Vec::new());
    ar.set_format(Format::Pax);
    ar.set_sparse(true);
    t!(ar.append_path_with_name(&path, Path::new("holey")));
    let data = t!(ar.into_inner());

    // Far less than a megabyte is actually stored.
    assert!(data.len() < 256 * 1024, "archive is {} bytes", data.len());

    let mut ar = Archive::new(Cursor::new(data));
    let mut entries = t!(ar.entries());
    let mut f = t!(entries.next().unwrap());
    assert_eq!(&*f.path_bytes(), b"holey");
    assert_eq!(f.size(), 1024 * 1024);
    let mut out = Vec::new();
    t!(f.write_logical_to(&mut out));
    assert_eq!(out.len(), 1024 * 1024);
    assert!(out[..1000].iter().all(|b| *b == 7));
    assert!(out[1000..700 * 1024].iter().all(|b| *b == 0));
    assert!(out[700 * 1024..700 * 1024 + 2000].iter().all(|b| *b == 9));
    assert!(out[700 * 1024 + 2000..].iter().all(|b| *b == 0));
}

#[test]
fn sparse_oldgnu_round_trip_through_builder() {
    let td = t!(TempDir::new());
    let path = td.path().join("holey");
    {
        let mut f = t!(File::create(&path));
        // Seven data islands force extension blocks past the four
        // header slots.
        for i in 0..7u64 {
            t!(f.seek(std::io::SeekFrom::Start(i * 200 * 1024)));
            t!(f.write_all(&vec![b'0' + i as u8; 4096]));
        }
        t!(f.set_len(2 * 1024 * 1024));
    }

    let mut ar = Builder::new(Vec::new());
    ar.set_format(Format::Gnu);
    ar.set_sparse(true);
    t!(ar.append_path_with_name(&path, Path::new("holey")));
    let data = t!(ar.into_inner());

    let mut ar = Archive::new(Cursor::new(data));
    let mut entries = t!(ar.entries());
    let mut f = t!(entries.next().unwrap());
    assert!(f.header().entry_type().is_gnu_sparse());
    assert_eq!(f.size(), 2 * 1024 * 1024);
    let map = f.sparse_map().unwrap().clone();
    assert_eq!(map.regions().len(), 7);
    let mut out = Vec::new();
    t!(f.write_logical_to(&mut out));
    assert_eq!(out.len(), 2 * 1024 * 1024);
    for i in 0..7usize {
        let start = i * 200 * 1024;
        assert!(out[start..start + 4096]
            .iter()
            .all(|b| *b == b'0' + i as u8));
    }
}

#[test]
fn extracting_directories() {
    let td = t!(TempDir::new());
    let mut ar = Archive::new(Cursor::new(tar!("directory.tar")));
    t!(ar.unpack(td.path()));

    let dir_d = td.path().join("d");
    let dir_b = td.path().join("d/b");
    let file_a = td.path().join("d/a.txt");
    let file_c = td.path().join("d/b/c.txt");
    assert!(dir_d.is_dir());
    assert!(dir_b.is_dir());
    assert!(file_a.is_file());
    assert!(file_c.is_file());
    assert_eq!(t!(fs::read(&file_a)), b"hi\n\n");
    assert_eq!(t!(fs::read(&file_c)), b"");
}

#[test]
fn extracting_malicious_paths_is_refused() {
    let td = t!(TempDir::new());

    let mut ar = Builder::new(Vec::new());
    let mut header = Header::new_gnu();
    header.set_size(4);
    header.set_mode(0o644);
    header.set_entry_type(EntryType::file());
    t!(ar.append_data(&mut header, "../escape.txt", &b"evil"[..]));
    let data = t!(ar.into_inner());

    let mut ar = Archive::new(Cursor::new(data));
    t!(ar.unpack(td.path()));
    assert!(!td.path().parent().unwrap().join("escape.txt").exists());
}

#[test]
fn ignore_zeros_reads_concatenated_streams() {
    let mut first = Builder::new(Vec::new());
    let mut header = Header::new_gnu();
    header.set_size(2);
    header.set_mode(0o644);
    header.set_entry_type(EntryType::file());
    t!(first.append_data(&mut header, "one", &b"1\n"[..]));
    let mut data = t!(first.into_inner());

    let mut second = Builder::new(Vec::new());
    let mut header = Header::new_gnu();
    header.set_size(2);
    header.set_mode(0o644);
    header.set_entry_type(EntryType::file());
    t!(second.append_data(&mut header, "two", &b"2\n"[..]));
    data.extend(t!(second.into_inner()));

    let mut ar = Archive::new(Cursor::new(&data[..]));
    ar.set_ignore_zeros(true);
    let names: Vec<String> = t!(ar.entries())
        .map(|e| String::from_utf8_lossy(&t!(e).path_bytes()).into_owned())
        .collect();
    assert_eq!(names, ["one", "two"]);

    // Without the flag the first terminator ends the scan.
    let mut ar = Archive::new(Cursor::new(&data[..]));
    let names: Vec<String> = t!(ar.entries())
        .map(|e| String::from_utf8_lossy(&t!(e).path_bytes()).into_owned())
        .collect();
    assert_eq!(names, ["one"]);
}

#[test]
fn pax_size_override_is_honored() {
    // The size record gives the logical length; the header field keeps
    // the stored length.
    let mut data = Vec::new();
    let payload = b"10 size=5\n";
    let mut xhdr = Header::new_ustar();
    t!(xhdr.set_path("PaxHeaders.0/short"));
    xhdr.set_size(payload.len() as u64);
    xhdr.set_mode(0o644);
    xhdr.set_entry_type(EntryType::pax_extensions());
    xhdr.set_cksum();
    data.extend_from_slice(xhdr.as_bytes());
    data.extend_from_slice(payload);
    data.resize(1024, 0);

    let mut real = Header::new_ustar();
    t!(real.set_path("short"));
    real.set_size(6);
    real.set_mode(0o644);
    real.set_entry_type(EntryType::file());
    real.set_cksum();
    data.extend_from_slice(real.as_bytes());
    data.extend_from_slice(b"abcdef");
    data.resize(1024 + 1024, 0);
    data.extend_from_slice(&[0u8; 1024]);

    let mut ar = Archive::new(Cursor::new(data));
    let mut entries = t!(ar.entries());
    let f = t!(entries.next().unwrap());
    assert_eq!(f.size(), 5);
    assert_eq!(f.stored_size(), 6);
    assert_eq!(f.pax_overrides().unwrap().size, Some(5));
}

#[test]
fn global_pax_applies_to_later_entries() {
    let mut data = Vec::new();
    let payload = b"20 uname=globaluser\n";
    let mut ghdr = Header::new_ustar();
    t!(ghdr.set_path("pax_global_header"));
    ghdr.set_size(payload.len() as u64);
    ghdr.set_mode(0o644);
    ghdr.set_entry_type(EntryType::pax_global_extensions());
    ghdr.set_cksum();
    data.extend_from_slice(ghdr.as_bytes());
    data.extend_from_slice(payload);
    data.resize(1024, 0);

    for name in ["first", "second"] {
        let mut h = Header::new_ustar();
        t!(h.set_path(name));
        h.set_size(0);
        h.set_mode(0o644);
        h.set_entry_type(EntryType::file());
        h.set_cksum();
        data.extend_from_slice(h.as_bytes());
    }
    data.extend_from_slice(&[0u8; 1024]);

    let mut ar = Archive::new(Cursor::new(data));
    let mut entries = t!(ar.entries());
    let first = t!(entries.next().unwrap());
    assert_eq!(first.username().as_deref(), Some("globaluser"));
    let second = t!(entries.next().unwrap());
    assert_eq!(second.username().as_deref(), Some("globaluser"));
}

#[test]
fn base256_sizes_survive_the_header() {
    let mut h = Header::new_gnu();
    h.set_size(8_589_934_592);
    h.set_cksum();
    assert!(h.cksum_valid());
    assert_eq!(t!(h.entry_size()), 8_589_934_592);
}

#[test]
fn builder_pads_to_the_blocking_factor() {
    let mut ar = Builder::new(Vec::new());
    ar.set_blocking_factor(20);
    let mut header = Header::new_gnu();
    header.set_size(1);
    header.set_mode(0o644);
    header.set_entry_type(EntryType::file());
    t!(ar.append_data(&mut header, "tiny", &b"x"[..]));
    let data = t!(ar.into_inner());
    assert_eq!(data.len() % (20 * 512), 0);
}
