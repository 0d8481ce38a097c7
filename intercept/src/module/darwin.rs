use core::ffi::{c_char, CStr};
use std::ffi::CString;

use crate::types::{ExportInfo, ModuleInfo};

#[allow(non_camel_case_types)]
mod macho {
    pub const MH_MAGIC_64: u32 = 0xfeed_facf;
    pub const LC_SEGMENT_64: u32 = 0x19;
    pub const LC_SYMTAB: u32 = 0x2;

    pub const N_EXT: u8 = 0x01;
    pub const N_TYPE: u8 = 0x0e;
    pub const N_SECT: u8 = 0x0e;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct mach_header_64 {
        pub magic: u32,
        pub cputype: i32,
        pub cpusubtype: i32,
        pub filetype: u32,
        pub ncmds: u32,
        pub sizeofcmds: u32,
        pub flags: u32,
        pub reserved: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct load_command {
        pub cmd: u32,
        pub cmdsize: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct segment_command_64 {
        pub cmd: u32,
        pub cmdsize: u32,
        pub segname: [u8; 16],
        pub vmaddr: u64,
        pub vmsize: u64,
        pub fileoff: u64,
        pub filesize: u64,
        pub maxprot: i32,
        pub initprot: i32,
        pub nsects: u32,
        pub flags: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct symtab_command {
        pub cmd: u32,
        pub cmdsize: u32,
        pub symoff: u32,
        pub nsyms: u32,
        pub stroff: u32,
        pub strsize: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct nlist_64 {
        pub n_strx: u32,
        pub n_type: u8,
        pub n_sect: u8,
        pub n_desc: u16,
        pub n_value: u64,
    }
}

use macho::{
    load_command, mach_header_64, nlist_64, segment_command_64, symtab_command, LC_SEGMENT_64, LC_SYMTAB,
    MH_MAGIC_64, N_EXT, N_SECT, N_TYPE,
};

extern "C" {
    fn _dyld_image_count() -> u32;
    fn _dyld_get_image_header(index: u32) -> *const mach_header_64;
    fn _dyld_get_image_name(index: u32) -> *const c_char;
    fn _dyld_get_image_vmaddr_slide(index: u32) -> isize;
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// A loaded Mach-O image as dyld reports it.
struct Image {
    header: *const mach_header_64,
    slide: isize,
    path: String,
}

fn images() -> impl Iterator<Item = Image> {
    (0..unsafe { _dyld_image_count() }).filter_map(|i| unsafe {
        let header = _dyld_get_image_header(i);
        if header.is_null() || (*header).magic != MH_MAGIC_64 {
            return None;
        }
        let name = _dyld_get_image_name(i);
        let path = if name.is_null() { String::new() } else { CStr::from_ptr(name).to_string_lossy().into_owned() };
        Some(Image { header, slide: _dyld_get_image_vmaddr_slide(i), path })
    })
}

unsafe fn for_each_command(header: *const mach_header_64, mut f: impl FnMut(*const load_command)) {
    let mut cmd = (header as *const u8).add(core::mem::size_of::<mach_header_64>()) as *const load_command;
    for _ in 0..(*header).ncmds {
        f(cmd);
        cmd = (cmd as *const u8).add((*cmd).cmdsize as usize) as *const load_command;
    }
}

unsafe fn for_each_segment(header: *const mach_header_64, mut f: impl FnMut(&segment_command_64)) {
    for_each_command(header, |cmd| {
        if (*cmd).cmd == LC_SEGMENT_64 {
            f(&*(cmd as *const segment_command_64));
        }
    });
}

/// Runtime address of a file offset, through the segment that maps it.
unsafe fn file_offset_address(image: &Image, offset: u64) -> Option<usize> {
    let mut out = None;
    for_each_segment(image.header, |seg| {
        if out.is_none() && offset >= seg.fileoff && offset < seg.fileoff.saturating_add(seg.filesize) {
            out = Some((seg.vmaddr as i128 + image.slide as i128 + (offset - seg.fileoff) as i128) as usize);
        }
    });
    out
}

unsafe fn image_range(image: &Image) -> Option<(usize, usize)> {
    let mut lowest: Option<u64> = None;
    let mut highest = 0u64;
    for_each_segment(image.header, |seg| {
        // __PAGEZERO maps nothing.
        if seg.vmsize == 0 || seg.initprot == 0 {
            return;
        }
        let start = (seg.vmaddr as i128 + image.slide as i128) as u64;
        lowest = Some(lowest.map_or(start, |m| m.min(start)));
        highest = highest.max(start.saturating_add(seg.vmsize));
    });
    lowest.map(|l| (l as usize, (highest - l) as usize))
}

/// Loaded images in dyld order; the main executable comes first.
pub fn enumerate_modules() -> Vec<ModuleInfo> {
    images()
        .enumerate()
        .map(|(i, image)| {
            let (base_address, size) = unsafe { image_range(&image) }.unwrap_or((image.header as usize, 0));
            let name = if image.path.is_empty() { format!("image_{i}") } else { basename(&image.path).to_string() };
            ModuleInfo { name, path: image.path, base_address, size }
        })
        .collect()
}

pub fn find_module(name: &str) -> Option<ModuleInfo> {
    enumerate_modules().into_iter().find(|m| m.matches(name))
}

/// Loads `name` with `dlopen`. The handle is intentionally never closed.
pub fn load_module(name: &str) -> bool {
    let Ok(cname) = CString::new(name) else { return false };
    !unsafe { libc::dlopen(cname.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) }.is_null()
}

/// Address of `symbol` as defined by `module` itself.
pub fn find_export(module: &ModuleInfo, symbol: &str) -> Option<usize> {
    enumerate_exports(module).into_iter().find(|e| e.name == symbol).map(|e| e.address)
}

/// External symbols defined in `module`, with the Mach-O leading underscore
/// removed so names match what `dlsym` takes.
pub fn enumerate_exports(module: &ModuleInfo) -> Vec<ExportInfo> {
    let Some(image) = images().find(|image| unsafe { image_range(image) }.map(|r| r.0) == Some(module.base_address))
    else {
        return Vec::new();
    };

    unsafe {
        let mut symtab: Option<symtab_command> = None;
        for_each_command(image.header, |cmd| {
            if (*cmd).cmd == LC_SYMTAB {
                symtab = Some(*(cmd as *const symtab_command));
            }
        });
        let Some(symtab) = symtab else { return Vec::new() };
        let (Some(symbols), Some(strings)) = (
            file_offset_address(&image, symtab.symoff as u64),
            file_offset_address(&image, symtab.stroff as u64),
        ) else {
            return Vec::new();
        };

        let symbols = symbols as *const nlist_64;
        let strings = strings as *const c_char;
        let mut out = Vec::new();
        for i in 0..symtab.nsyms as usize {
            let sym = *symbols.add(i);
            if sym.n_type & N_EXT == 0 || sym.n_type & N_TYPE != N_SECT || sym.n_value == 0 || sym.n_strx == 0 {
                continue;
            }
            let raw = CStr::from_ptr(strings.add(sym.n_strx as usize)).to_string_lossy();
            out.push(ExportInfo {
                name: raw.strip_prefix('_').unwrap_or(&raw).to_string(),
                address: (sym.n_value as i128 + image.slide as i128) as usize,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_executable_is_listed_first() {
        let modules = enumerate_modules();
        let here = main_executable_is_listed_first as usize;
        assert!(modules[0].contains(here));
    }

    #[test]
    fn libsystem_exports_match_dlsym() {
        let module = find_module("libsystem_kernel.dylib").unwrap();
        let expected = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"getpid".as_ptr()) } as usize;
        assert_eq!(find_export(&module, "getpid"), Some(expected));
    }
}
