//! A thin driver over `orbisfs_core`: list, read and stat files inside an
//! image. The full FUSE adapter and a richer CLI remain out of scope.

use orbisfs_core::image::Image;
use std::env;
use std::io::Write as _;
use std::path::Path;
use std::process::exit;

fn print_usage(bin: &str) {
    eprintln!("Usage:");
    eprintln!(" {bin} ls <image> [path]");
    eprintln!(" {bin} cat <image> <path>");
    eprintln!(" {bin} stat <image> <path>");
    eprintln!();
    eprintln!("Options:");
    eprintln!(" image:\tpath to an OrbisFS disk image");
    eprintln!(" path:\ta /-separated path inside the image, or iNode<N> to address an inode directly");
}

fn open_image(path: &str) -> Box<Image> {
    Image::open(Path::new(path), false, 0).unwrap_or_else(|e| {
        eprintln!("{path}: {e}");
        exit(1);
    })
}

fn cmd_ls(image_path: &str, dir_path: &str) {
    let image = open_image(image_path);
    let entries = image.list_files_in_folder(dir_path).unwrap_or_else(|e| {
        eprintln!("{dir_path}: {e}");
        exit(1);
    });
    for entry in entries {
        let kind = if entry.entry_type == orbisfs_core::format::DIRECTORY_TYPE_DIR {
            'd'
        } else {
            '-'
        };
        println!("{kind} {:>10} {}", entry.inode_num, entry.name);
    }
}

fn cmd_cat(image_path: &str, file_path: &str) {
    let image = open_image(image_path);
    let file = image.open_file_at_path(file_path).unwrap_or_else(|e| {
        eprintln!("{file_path}: {e}");
        exit(1);
    });
    let mut buf = vec![0u8; file.filesize() as usize];
    file.pread(0, &mut buf).unwrap_or_else(|e| {
        eprintln!("{file_path}: {e}");
        exit(1);
    });
    std::io::stdout().write_all(&buf).unwrap_or_else(|e| {
        eprintln!("stdout: {e}");
        exit(1);
    });
}

fn cmd_stat(image_path: &str, path: &str) {
    let image = open_image(image_path);
    let file = image.get_inode_for_path(path).unwrap_or_else(|e| {
        eprintln!("{path}: {e}");
        exit(1);
    });
    println!("inode:   {}", file.inode_num());
    println!("mode:    {:#o}", file.file_mode());
    println!("size:    {}", utils::util::ByteSize(file.filesize()));
    println!("blocks:  {}", file.used_blocks());
    println!("is_dir:  {}", file.is_dir());
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let bin = args.first().map(String::as_str).unwrap_or("orbisfs");
    let a: Vec<&str> = args.iter().map(String::as_str).collect();

    match a[1..] {
        [] | ["-h"] => {
            print_usage(bin);
            exit(if a.len() <= 1 { 1 } else { 0 });
        }

        ["ls", image] => cmd_ls(image, ""),
        ["ls", image, path] => cmd_ls(image, path),
        ["cat", image, path] => cmd_cat(image, path),
        ["stat", image, path] => cmd_stat(image, path),

        _ => {
            print_usage(bin);
            exit(1);
        }
    }
}
