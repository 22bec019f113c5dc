//! Dependency resolution over a registry snapshot.
//!
//! # Invariants
//! - Output lists every transitive dependency strictly before its dependents,
//!   with the requested tag last.
//! - Sibling order follows `dependencies` declaration order; priority never
//!   participates.
//! - Resolution is pure: it reads the snapshot and nothing else.

use crate::extension::descriptor::ExtensionDescriptor;
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Read-only descriptor lookup the resolver runs against.
pub trait DescriptorLookup {
    fn descriptor(&self, tag: &str) -> Option<&ExtensionDescriptor>;
}

impl DescriptorLookup for BTreeMap<String, ExtensionDescriptor> {
    fn descriptor(&self, tag: &str) -> Option<&ExtensionDescriptor> {
        self.get(tag)
    }
}

impl DescriptorLookup for HashMap<String, ExtensionDescriptor> {
    fn descriptor(&self, tag: &str) -> Option<&ExtensionDescriptor> {
        self.get(tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// One level of the explicit depth-first stack.
#[derive(Clone, Copy)]
struct Frame<'a> {
    tag: &'a str,
    descriptor: &'a ExtensionDescriptor,
    next: usize,
}

/// Computes a safe load order for `tag`.
///
/// The walk keeps its own stack, so chain depth is bounded by memory rather
/// than by the thread stack.
///
/// # Errors
/// - `NotFound` when `tag` itself is absent.
/// - `MissingDependency` when any transitive dependency is absent.
/// - `Cycle` with the full cycle path (first and last element equal).
pub fn resolve_order<'a>(
    lookup: &'a impl DescriptorLookup,
    tag: &'a str,
) -> Result<Vec<String>, ResolveError> {
    let Some(root) = lookup.descriptor(tag) else {
        return Err(ResolveError::NotFound(tag.to_string()));
    };

    let mut marks = HashMap::<&str, Mark>::from([(tag, Mark::Visiting)]);
    let mut stack = vec![Frame {
        tag,
        descriptor: root,
        next: 0,
    }];
    let mut order = Vec::<String>::new();

    while let Some(frame) = stack.last_mut() {
        let Frame {
            tag: current,
            descriptor,
            next,
        } = *frame;
        let Some(dependency) = descriptor.dependencies.get(next) else {
            marks.insert(current, Mark::Done);
            order.push(current.to_string());
            stack.pop();
            continue;
        };
        frame.next += 1;

        match marks.get(dependency.as_str()) {
            Some(Mark::Done) => continue,
            Some(Mark::Visiting) => {
                let start = stack
                    .iter()
                    .position(|seen| seen.tag == dependency.as_str())
                    .unwrap_or(0);
                let mut cycle: Vec<String> =
                    stack[start..].iter().map(|seen| seen.tag.to_string()).collect();
                cycle.push(dependency.clone());
                return Err(ResolveError::Cycle(cycle));
            }
            None => {}
        }

        let Some(child) = lookup.descriptor(dependency) else {
            return Err(ResolveError::MissingDependency {
                tag: current.to_string(),
                missing: dependency.clone(),
            });
        };
        marks.insert(dependency, Mark::Visiting);
        stack.push(Frame {
            tag: dependency,
            descriptor: child,
            next: 0,
        });
    }

    Ok(order)
}

/// Resolution failures. All of them are detected before any fetch starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    NotFound(String),
    MissingDependency { tag: String, missing: String },
    Cycle(Vec<String>),
}

impl Display for ResolveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(tag) => write!(f, "extension not registered: {tag}"),
            Self::MissingDependency { tag, missing } => {
                write!(f, "{tag} depends on unregistered extension {missing}")
            }
            Self::Cycle(path) => write!(f, "dependency cycle: {}", path.join(" -> ")),
        }
    }
}

impl Error for ResolveError {}
