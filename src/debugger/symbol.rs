use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::error::Error;
use log::debug;
use nix::unistd::Pid;
use object::{Object, ObjectKind, ObjectSegment, ObjectSymbol, SymbolKind};
use proc_maps::MapRange;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

#[derive(Debug, Clone, Copy)]
struct SymbolVal {
    kind: SymbolKind,
    addr: GlobalAddress,
}

/// Symbols defined in a single object file, keyed by a demangled name.
#[derive(Debug)]
pub struct SymbolTab {
    kind: ObjectKind,
    /// Lowest virtual address of loadable segments.
    base_vaddr: u64,
    symbols: HashMap<String, SymbolVal>,
}

impl SymbolTab {
    pub fn new<'data, 'file, OBJ>(object_file: &'file OBJ) -> Self
    where
        'data: 'file,
        OBJ: Object<'data, 'file>,
    {
        let mut symbols = HashMap::new();
        // dynamic symbols first, full symbol table wins for duplicates
        let all = object_file
            .dynamic_symbols()
            .chain(object_file.symbols())
            .filter(|s| s.is_definition());
        for symbol in all {
            let Ok(name) = symbol.name() else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let name = rustc_demangle::demangle(name).to_string();
            symbols.insert(
                name,
                SymbolVal {
                    kind: symbol.kind(),
                    addr: symbol.address().into(),
                },
            );
        }

        let base_vaddr = object_file
            .segments()
            .map(|s| s.address())
            .min()
            .unwrap_or_default();

        Self {
            kind: object_file.kind(),
            base_vaddr,
            symbols,
        }
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;
        Ok(Self::new(&object))
    }

    pub fn find(&self, name: &str) -> Option<(GlobalAddress, SymbolKind)> {
        self.symbols.get(name).map(|s| (s.addr, s.kind))
    }

    /// Difference between where an object is mapped and where it wants to be.
    pub fn load_bias(&self, lowest_mapping: usize) -> usize {
        load_bias(self.kind, lowest_mapping, self.base_vaddr)
    }
}

fn load_bias(kind: ObjectKind, lowest_mapping: usize, base_vaddr: u64) -> usize {
    match kind {
        ObjectKind::Dynamic => lowest_mapping.saturating_sub((base_vaddr & !0xfff) as usize),
        _ => 0,
    }
}

/// Symbol found in a target address space.
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub addr: RelocatedAddress,
    pub kind: SymbolKind,
    pub object: PathBuf,
}

/// Find symbols across all objects mapped into a target process.
#[derive(Default)]
pub struct SymbolResolver {
    tables: HashMap<PathBuf, Option<Rc<SymbolTab>>>,
}

impl SymbolResolver {
    fn table(&mut self, path: &Path) -> Option<Rc<SymbolTab>> {
        self.tables
            .entry(path.to_path_buf())
            .or_insert_with(|| match SymbolTab::load(path) {
                Ok(tab) => Some(Rc::new(tab)),
                Err(e) => {
                    debug!(target: "debugger", "skip object {path:?}: {e:#}");
                    None
                }
            })
            .clone()
    }

    /// Forget all loaded tables, objects may be replaced by `exec`.
    pub fn reset(&mut self) {
        self.tables.clear();
    }

    /// Find a symbol by name, objects are scanned in order of their mapping address.
    pub fn resolve(&mut self, pid: Pid, name: &str) -> Result<Option<Symbol>, Error> {
        let maps: Vec<MapRange> = proc_maps::get_process_maps(pid.as_raw())?;

        for (object, lowest_mapping) in mapped_objects(&maps) {
            let Some(table) = self.table(&object) else {
                continue;
            };
            if let Some((addr, kind)) = table.find(name) {
                let addr = addr.relocate(table.load_bias(lowest_mapping));
                debug!(target: "debugger", "symbol `{name}` resolved at {addr} in {object:?}");
                return Ok(Some(Symbol { addr, kind, object }));
            }
        }

        Ok(None)
    }
}

/// Files mapped into memory with their lowest mapping address, ordered by that address.
fn mapped_objects(maps: &[MapRange]) -> Vec<(PathBuf, usize)> {
    let mut objects: Vec<(PathBuf, usize)> = vec![];
    for map in maps {
        let Some(file) = map.filename() else {
            continue;
        };
        if !file.is_absolute() {
            continue;
        }
        match objects.iter_mut().find(|(f, _)| f == file) {
            Some((_, start)) => *start = (*start).min(map.start()),
            None => objects.push((file.to_path_buf(), map.start())),
        }
    }
    objects.sort_by_key(|(_, start)| *start);
    objects
}
