//! Program descriptions shared by clients and servers.
//!
//! A [`Program`] is the procedure table of one (program, version) pair. For
//! every procedure it records a name and how to decode and pretty-print its
//! argument, which is all a server needs before handing a call to the
//! application.

use std::any::Any;
use std::fmt::{self, Debug};
use std::io;

use crate::xdr::{deserialize, Deserialize};

type ArgDecoder = fn(&mut &[u8]) -> io::Result<Box<dyn Any + Send>>;
type ArgPrinter = fn(&(dyn Any + Send)) -> String;

fn decode_arg<A>(src: &mut &[u8]) -> io::Result<Box<dyn Any + Send>>
where
    A: Deserialize + Default + Send + 'static,
{
    Ok(Box::new(deserialize::<A>(src)?))
}

fn print_arg<A: Debug + 'static>(arg: &(dyn Any + Send)) -> String {
    match arg.downcast_ref::<A>() {
        Some(arg) => format!("{arg:?}"),
        None => "<foreign argument>".to_string(),
    }
}

/// One entry of a procedure table.
#[derive(Clone)]
pub struct Procedure {
    name: &'static str,
    decode: ArgDecoder,
    print: ArgPrinter,
}

impl Procedure {
    /// A procedure whose argument decodes as `A`.
    pub fn new<A>(name: &'static str) -> Self
    where
        A: Deserialize + Default + Debug + Send + 'static,
    {
        Self { name, decode: decode_arg::<A>, print: print_arg::<A> }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn decode_args(&self, src: &mut &[u8]) -> io::Result<Box<dyn Any + Send>> {
        (self.decode)(src)
    }

    /// Formats an argument previously decoded by this procedure.
    pub fn describe(&self, arg: &(dyn Any + Send)) -> String {
        (self.print)(arg)
    }
}

impl Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// The procedure table of one program version.
///
/// Procedure numbers are indices into the table, so procedures must be
/// added in order starting with procedure 0.
#[derive(Clone, Debug)]
pub struct Program {
    name: &'static str,
    number: u32,
    version: u32,
    procedures: Vec<Procedure>,
}

impl Program {
    pub fn new(name: &'static str, number: u32, version: u32) -> Self {
        Self { name, number, version, procedures: Vec::new() }
    }

    /// Appends the next procedure, whose argument decodes as `A`.
    pub fn procedure<A>(mut self, name: &'static str) -> Self
    where
        A: Deserialize + Default + Debug + Send + 'static,
    {
        self.procedures.push(Procedure::new::<A>(name));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Number of procedures.
    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }

    pub fn get(&self, proc: u32) -> Option<&Procedure> {
        self.procedures.get(proc as usize)
    }

    /// `name:version.procedure` for log lines.
    pub(crate) fn label(&self, proc: u32) -> String {
        match self.get(proc) {
            Some(p) => format!("{}:{}.{}", self.name, self.version, p.name),
            None => format!("{}:{}.{}", self.name, self.version, proc),
        }
    }
}
