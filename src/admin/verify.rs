use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_relation;
use crate::admin::Result;
use crate::storage::attstream::ToastPointer;
use crate::storage::catalog::{self, PageClass, Trailer};
use crate::storage::meta;
use crate::storage::Relation;
use crate::types::{AttrNum, BlockNumber, Tid};

const MAX_FINDINGS: usize = 32;

/// Specifies the depth of verification checks to perform.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// Classify every page and decode the meta page.
    Fast,
    /// Also walk every tree, the undo chain, the free list and every TOAST
    /// chain.
    Full,
}

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Informational message about the verification process.
    Info,
    /// Non-critical issue that may indicate a problem.
    Warning,
    /// Critical issue indicating data corruption or integrity failure.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Human-readable description of the issue.
    pub message: String,
}

impl VerifyFinding {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Warning,
            message: message.into(),
        }
    }
}

/// Page and structure counts gathered while verifying.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    pub pages: u64,
    pub btree_pages: u64,
    pub undo_pages: u64,
    pub toast_pages: u64,
    pub free_pages: u64,
    pub new_pages: u64,
    pub unrecognized_pages: u64,
    /// Leaves reached through the `next` chains.
    pub leaves: u64,
    /// Items across every attribute tree, tid tree included.
    pub items: u64,
    pub toast_chains: u64,
}

/// Complete report of a verification operation.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// The verification level that was performed.
    pub level: VerifyLevel,
    /// Whether no error-level finding was recorded.
    pub success: bool,
    /// List of issues discovered during verification.
    pub findings: Vec<VerifyFinding>,
    /// Statistics about the structures examined.
    pub counts: VerifyCounts,
}

/// Verifies the relation file at `path`.
///
/// # Errors
///
/// Returns an error if the relation cannot be opened. Damage found after
/// that is reported as findings.
pub fn verify(path: impl AsRef<Path>, opts: &AdminOpenOptions, level: VerifyLevel) -> Result<VerifyReport> {
    let rel = open_relation(path.as_ref(), opts, &[])?;
    Ok(verify_relation(&rel, level))
}

/// Verifies an open relation.
pub fn verify_relation(rel: &Relation, level: VerifyLevel) -> VerifyReport {
    let mut findings = Vec::new();
    let mut counts = VerifyCounts::default();
    let mut chain_heads = Vec::new();

    classify_pages(rel, &mut findings, &mut counts, &mut chain_heads);
    if let Err(err) = meta::read_meta(rel.pool()) {
        push_error(&mut findings, format!("meta page unreadable: {err}"));
    }

    if matches!(level, VerifyLevel::Full) {
        for attno in 0..=rel.natts() as AttrNum {
            match rel.tree().check_partition(attno) {
                Ok(report) => {
                    counts.leaves += report.leaves as u64;
                    counts.items += report.items as u64;
                }
                Err(err) => push_error(&mut findings, format!("attribute {attno}: {err}")),
            }
        }
        match rel.undo().pages() {
            Ok(pages) => {
                for page in pages {
                    if let Err(err) = page {
                        push_error(&mut findings, format!("undo chain: {err}"));
                        break;
                    }
                }
            }
            Err(err) => push_error(&mut findings, format!("undo chain: {err}")),
        }
        match meta::free_list(rel.pool()) {
            Ok(free) if free.len() as u64 != counts.free_pages => push_warning(
                &mut findings,
                format!(
                    "free list holds {} pages but {} free pages exist",
                    free.len(),
                    counts.free_pages
                ),
            ),
            Ok(_) => {}
            Err(err) => push_error(&mut findings, format!("free list: {err}")),
        }
        for (block, tid, total_size) in chain_heads {
            let ptr = ToastPointer {
                first_block: block,
                total_size,
            };
            match rel.toast().chunks(tid, ptr) {
                Ok(_) => counts.toast_chains += 1,
                Err(err) => push_error(&mut findings, format!("toast chain at block {block}: {err}")),
            }
        }
    }

    VerifyReport {
        level,
        success: !findings
            .iter()
            .any(|f| matches!(f.severity, VerifySeverity::Error)),
        findings,
        counts,
    }
}

fn classify_pages(
    rel: &Relation,
    findings: &mut Vec<VerifyFinding>,
    counts: &mut VerifyCounts,
    chain_heads: &mut Vec<(BlockNumber, Tid, u64)>,
) {
    for n in 0..rel.pool().nblocks() {
        let block = BlockNumber(n);
        counts.pages += 1;
        let page = match rel.pool().read(block) {
            Ok(page) => page,
            Err(err) => {
                push_error(findings, format!("block {block}: {err}"));
                continue;
            }
        };
        match catalog::inspect(page.data()) {
            PageClass::New => counts.new_pages += 1,
            PageClass::Typed(Trailer::Meta(_)) => {}
            PageClass::Typed(Trailer::Btree(_)) => counts.btree_pages += 1,
            PageClass::Typed(Trailer::Undo(_)) => counts.undo_pages += 1,
            PageClass::Typed(Trailer::Toast(op)) => {
                counts.toast_pages += 1;
                if op.slice_offset == 0 {
                    chain_heads.push((block, op.tid, op.total_size));
                }
            }
            PageClass::Typed(Trailer::Free(_)) => counts.free_pages += 1,
            PageClass::Malformed { tag, special_size } => push_error(
                findings,
                format!("block {block}: tag {tag:#06x} with special size {special_size}"),
            ),
            PageClass::Unrecognized(tag) => {
                counts.unrecognized_pages += 1;
                push_warning(findings, format!("block {block}: unrecognized tag {tag:#06x}"));
            }
        }
        if findings.len() >= MAX_FINDINGS {
            break;
        }
    }
}

fn push_error(findings: &mut Vec<VerifyFinding>, message: impl Into<String>) {
    if findings.len() < MAX_FINDINGS {
        findings.push(VerifyFinding::error(message.into()));
    }
}

fn push_warning(findings: &mut Vec<VerifyFinding>, message: impl Into<String>) {
    if findings.len() < MAX_FINDINGS {
        findings.push(VerifyFinding::warning(message.into()));
    }
}
