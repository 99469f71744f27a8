// src/files.rs
use std::fs;
use std::io;
use std::path::Path;

pub fn content_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

pub fn load(path: &Path) -> io::Result<Vec<u8>> {
    let metadata = fs::metadata(path)?;
    if !metadata.is_file() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "not a regular file"));
    }
    fs::read(path)
}

/// Autoindex page: one anchor per directory entry, directories suffixed
/// with '/'. Entries come out sorted so listings are stable.
pub fn directory_listing(fs_path: &Path, uri_path: &str) -> io::Result<String> {
    let mut names = Vec::new();
    for entry in fs::read_dir(fs_path)? {
        let entry = entry?;
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();

    let mut page = String::new();
    page.push_str(&format!(
        "<html><head><title>Index of {uri_path}</title></head><body>\
         <h1>Index of {uri_path}</h1><hr><pre>"
    ));
    page.push_str("<a href=\"../\">../</a>\n");
    for name in &names {
        page.push_str(&format!("<a href=\"{name}\">{name}</a>\n"));
    }
    page.push_str("</pre><hr></body></html>");
    Ok(page)
}

/// Store an uploaded body under `dir`, creating the directory if needed.
pub fn save_upload(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(name), bytes)
}

/// Delete a regular file; directories are refused.
pub fn delete(path: &Path) -> io::Result<()> {
    let metadata = fs::metadata(path)?;
    if !metadata.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "refusing to delete a non-file",
        ));
    }
    fs::remove_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(content_type(&PathBuf::from("a.html")), "text/html");
        assert_eq!(content_type(&PathBuf::from("a.css")), "text/css");
        assert_eq!(
            content_type(&PathBuf::from("a.bin")),
            "application/octet-stream"
        );
    }

    #[test]
    fn listing_and_upload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        save_upload(dir.path(), "b.txt", b"two").unwrap();
        save_upload(dir.path(), "a.txt", b"one").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let page = directory_listing(dir.path(), "/files/").unwrap();
        assert!(page.contains("Index of /files/"));
        assert!(page.contains("<a href=\"a.txt\">a.txt</a>"));
        assert!(page.contains("<a href=\"sub/\">sub/</a>"));
        // Sorted: a.txt before b.txt.
        assert!(page.find("a.txt").unwrap() < page.find("b.txt").unwrap());

        assert_eq!(load(&dir.path().join("a.txt")).unwrap(), b"one");
    }

    #[test]
    fn delete_refuses_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert!(delete(dir.path()).is_err());

        let file = dir.path().join("x");
        fs::write(&file, b"x").unwrap();
        delete(&file).unwrap();
        assert!(!file.exists());
    }
}
