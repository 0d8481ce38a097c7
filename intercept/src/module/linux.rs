use core::ffi::{c_char, c_void};
use std::ffi::{CStr, CString};

use crate::types::{ExportInfo, ModuleInfo};

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn main_executable_path() -> String {
    std::fs::read_link("/proc/self/exe")
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

unsafe fn module_path(info: &libc::dl_phdr_info) -> (String, bool) {
    if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
        (main_executable_path(), true)
    } else {
        (CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned(), false)
    }
}

unsafe fn phdrs<'a>(info: &'a libc::dl_phdr_info) -> &'a [libc::Elf64_Phdr] {
    if info.dlpi_phdr.is_null() {
        return &[];
    }
    core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize)
}

/// Calls `f` for every loaded object until it returns `false`.
fn iterate_phdr(mut f: impl FnMut(&libc::dl_phdr_info) -> bool) {
    unsafe extern "C" fn callback(info: *mut libc::dl_phdr_info, _size: libc::size_t, data: *mut c_void) -> libc::c_int {
        let f = &mut *(data as *mut &mut dyn FnMut(&libc::dl_phdr_info) -> bool);
        if f(&*info) {
            0
        } else {
            1
        }
    }

    let mut f: &mut dyn FnMut(&libc::dl_phdr_info) -> bool = &mut f;
    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut f as *mut _ as *mut c_void);
    }
}

/// Loaded objects in load order; the main executable comes first.
pub fn enumerate_modules() -> Vec<ModuleInfo> {
    let mut modules = Vec::new();
    iterate_phdr(|info| {
        let (path, _) = unsafe { module_path(info) };

        let mut lowest: Option<u64> = None;
        let mut highest = 0u64;
        for phdr in unsafe { phdrs(info) } {
            if phdr.p_type == libc::PT_LOAD && phdr.p_memsz > 0 {
                lowest = Some(lowest.map_or(phdr.p_vaddr, |m| m.min(phdr.p_vaddr)));
                highest = highest.max(phdr.p_vaddr + phdr.p_memsz);
            }
        }
        let Some(lowest) = lowest else { return true };

        let name = if path.is_empty() { String::from("[unknown]") } else { basename(&path).to_string() };
        modules.push(ModuleInfo {
            name,
            path,
            base_address: info.dlpi_addr as usize + lowest as usize,
            size: (highest - lowest) as usize,
        });
        true
    });
    modules
}

pub fn find_module(name: &str) -> Option<ModuleInfo> {
    enumerate_modules().into_iter().find(|m| m.matches(name))
}

/// Loads `name` with `dlopen`. The handle is intentionally never closed.
pub fn load_module(name: &str) -> bool {
    let Ok(cname) = CString::new(name) else { return false };
    !unsafe { libc::dlopen(cname.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) }.is_null()
}

/// Address of `symbol` as exported by `module` itself.
///
/// `dlsym` on a library handle also searches its dependencies, so the
/// result only counts when it lies inside `module`.
pub fn find_export(module: &ModuleInfo, symbol: &str) -> Option<usize> {
    let csym = CString::new(symbol).ok()?;
    let is_main = module.path == main_executable_path();

    let handle = if is_main {
        unsafe { libc::dlopen(core::ptr::null(), libc::RTLD_NOW) }
    } else {
        let cpath = CString::new(module.path.as_str()).ok()?;
        unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_NOLOAD | libc::RTLD_NOW) }
    };

    let address = if handle.is_null() {
        None
    } else {
        let p = unsafe { libc::dlsym(handle, csym.as_ptr()) } as usize;
        // Balances the reference taken by the lookup open above.
        unsafe { libc::dlclose(handle) };
        Some(p).filter(|&p| p != 0)
    };

    address
        .filter(|&a| module.contains(a))
        .or_else(|| {
            // The vDSO and similar objects have no dlopen handle.
            enumerate_exports(module).into_iter().find(|e| e.name == symbol).map(|e| e.address)
        })
}

mod elf {
    pub const DT_NULL: i64 = 0;
    pub const DT_HASH: i64 = 4;
    pub const DT_STRTAB: i64 = 5;
    pub const DT_SYMTAB: i64 = 6;
    pub const DT_GNU_HASH: i64 = 0x6fff_fef5;

    pub const STB_GLOBAL: u8 = 1;
    pub const STB_WEAK: u8 = 2;
    pub const SHN_UNDEF: u16 = 0;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Elf64Sym {
        pub st_name: u32,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
        pub st_value: u64,
        pub st_size: u64,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Elf64Dyn {
        pub d_tag: i64,
        pub d_val: u64,
    }
}

/// Global and weak symbols defined by `module`, read from its in-memory
/// dynamic symbol table.
pub fn enumerate_exports(module: &ModuleInfo) -> Vec<ExportInfo> {
    let mut exports = Vec::new();
    iterate_phdr(|info| {
        let Some(dynamic) = (unsafe { phdrs(info) }).iter().find(|p| p.p_type == libc::PT_DYNAMIC) else {
            return true;
        };
        let load_base = info.dlpi_addr as usize;
        let first_load = unsafe { phdrs(info) }
            .iter()
            .filter(|p| p.p_type == libc::PT_LOAD)
            .map(|p| p.p_vaddr as usize)
            .min()
            .unwrap_or(0);
        if load_base + first_load != module.base_address {
            return true;
        }
        unsafe { read_dynamic_symbols(info.dlpi_addr, (info.dlpi_addr + dynamic.p_vaddr) as usize, &mut exports) };
        false
    });
    exports
}

unsafe fn read_dynamic_symbols(base: u64, dynamic: usize, out: &mut Vec<ExportInfo>) {
    let (mut symtab, mut strtab, mut hash, mut gnu_hash) = (0u64, 0u64, 0u64, 0u64);
    let mut entry = dynamic as *const elf::Elf64Dyn;
    loop {
        let e = *entry;
        match e.d_tag {
            elf::DT_NULL => break,
            elf::DT_SYMTAB => symtab = e.d_val,
            elf::DT_STRTAB => strtab = e.d_val,
            elf::DT_HASH => hash = e.d_val,
            elf::DT_GNU_HASH => gnu_hash = e.d_val,
            _ => {}
        }
        entry = entry.add(1);
    }
    if symtab == 0 || strtab == 0 {
        return;
    }

    // ld.so relocates these entries in place; the vDSO leaves them as
    // file addresses.
    let relocated = symtab > base || strtab > base;
    let absolute = |v: u64| if relocated { v as usize } else { (base + v) as usize };

    let count = if hash != 0 {
        // nbucket, nchain: nchain equals the symbol count.
        *(absolute(hash) as *const u32).add(1) as usize
    } else if gnu_hash != 0 {
        gnu_hash_symbol_count(absolute(gnu_hash) as *const u32)
    } else {
        return;
    };

    let symbols = absolute(symtab) as *const elf::Elf64Sym;
    let strings = absolute(strtab) as *const c_char;
    for i in 0..count {
        let sym = *symbols.add(i);
        let bind = sym.st_info >> 4;
        if sym.st_shndx == elf::SHN_UNDEF || sym.st_value == 0 || sym.st_name == 0 {
            continue;
        }
        if bind != elf::STB_GLOBAL && bind != elf::STB_WEAK {
            continue;
        }
        let name = CStr::from_ptr(strings.add(sym.st_name as usize)).to_string_lossy().into_owned();
        out.push(ExportInfo { name, address: base as usize + sym.st_value as usize });
    }
}

/// GNU hash tables do not record the symbol count; it is one past the last
/// entry of the longest-indexed chain.
unsafe fn gnu_hash_symbol_count(table: *const u32) -> usize {
    let nbuckets = *table as usize;
    let symoffset = *table.add(1);
    let bloom_words = *table.add(2) as usize;

    let buckets = (table.add(4) as *const u64).add(bloom_words) as *const u32;
    let chains = buckets.add(nbuckets);

    let last_bucket = (0..nbuckets).map(|i| *buckets.add(i)).max().unwrap_or(0);
    if last_bucket < symoffset {
        return symoffset as usize;
    }
    let mut index = last_bucket;
    while *chains.add((index - symoffset) as usize) & 1 == 0 {
        index += 1;
    }
    index as usize + 1
}
