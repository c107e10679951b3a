//! Task graph builder (C2, spec §4.2): converts a list of described objects
//! into `taskOrder`, `queryOrder`, and `deleteOrder`.

use std::collections::HashSet;

use crate::model::ObjectTable;

const MAX_BUBBLE_PASSES: usize = 10;

/// Known right-must-precede-left pairs for query ordering (spec §4.2 step
/// 5): `(right, left)` means `right` must appear before `left` in
/// `queryOrder`. `AccountContactRelation` is a true Salesforce junction
/// object that must be queried after the objects it relates.
const SPECIAL_OBJECT_QUERY_ORDER: &[(&str, &[&str])] = &[
    ("AccountContactRelation", &["Account", "Contact", "Case"]),
    ("OpportunityContactRole", &["Opportunity", "Contact"]),
    ("CaseContactRole", &["Case", "Contact"]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingMode {
    /// Emit tasks in the order the user declared, no further reasoning.
    Preserve,
    /// Parent-before-child ordering with master-detail bubble passes.
    Smart,
}

#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    pub task_order: Vec<String>,
    pub query_order: Vec<String>,
    pub delete_order: Vec<String>,
}

/// Per-object hints the graph builder needs beyond the schema table: which
/// objects are queried unbounded ("process-all"), which are readonly, and
/// whether each is a master-detail child of another described object.
pub struct GraphInput<'a> {
    pub objects: &'a ObjectTable,
    /// Declaration order as the user wrote the script.
    pub declared_order: Vec<String>,
    pub readonly: HashSet<String>,
    /// Objects queried with no filter (their full set is fetched).
    pub process_all: HashSet<String>,
}

fn is_master_detail_parent_of(objects: &ObjectTable, parent: &str, child: &str) -> bool {
    objects
        .get(child)
        .map(|c| {
            c.lookup_fields()
                .any(|f| f.is_master_detail && f.referenced_objects.iter().any(|r| r == parent))
        })
        .unwrap_or(false)
}

fn has_unsatisfied_parent_lookup(objects: &ObjectTable, candidate: &str, already_placed: &[String]) -> bool {
    let Some(desc) = objects.get(candidate) else { return false };
    desc.lookup_fields().any(|f| {
        f.referenced_objects.iter().any(|parent| {
            objects.contains(parent) && parent != candidate && !already_placed.iter().any(|p| p == parent)
        })
    })
}

/// Build `taskOrder`, `queryOrder`, and `deleteOrder` per spec §4.2.
pub fn build_task_graph(input: &GraphInput, mode: OrderingMode) -> TaskGraph {
    if mode == OrderingMode::Preserve {
        let task_order = input.declared_order.clone();
        let delete_order = task_order.iter().rev().cloned().collect();
        return TaskGraph { task_order: task_order.clone(), query_order: task_order, delete_order };
    }

    let mut task_order: Vec<String> = Vec::new();

    // 1. RecordType first, if present.
    if input.declared_order.iter().any(|o| o == "RecordType") {
        task_order.push("RecordType".to_string());
    }

    // 2. Readonly objects, in declaration order.
    for name in &input.declared_order {
        if name != "RecordType" && input.readonly.contains(name) {
            task_order.push(name.clone());
        }
    }

    // 3. Remaining objects, each inserted so every parent-lookup object
    //    already placed precedes it. Repeated passes over the remaining
    //    set handle chains longer than one hop.
    let mut remaining: Vec<String> = input
        .declared_order
        .iter()
        .filter(|n| *n != "RecordType" && !input.readonly.contains(*n))
        .cloned()
        .collect();

    while !remaining.is_empty() {
        let mut progressed = false;
        let mut still_remaining = Vec::new();
        for name in remaining {
            if has_unsatisfied_parent_lookup(input.objects, &name, &task_order) {
                still_remaining.push(name);
            } else {
                task_order.push(name);
                progressed = true;
            }
        }
        if !progressed {
            // Unresolvable cycle (e.g. Account <-> Contact both lookup each
            // other without master-detail) — place the rest in declaration
            // order; the bubble pass and the C3 two-pass retrieval are what
            // actually break such cycles, per spec §9.
            task_order.extend(still_remaining);
            break;
        }
        remaining = still_remaining;
    }

    // 4. Bubble pass: swap (left, right) if right is a master-detail parent
    //    of left.
    bubble_pass(&mut task_order, MAX_BUBBLE_PASSES, |order, i, j| {
        is_master_detail_parent_of(input.objects, &order[j], &order[i])
    });

    // 5. queryOrder: master-detail children / bounded-query / readonly
    //    objects first, then the rest in taskOrder order; second bubble
    //    pass keyed on SPECIAL_OBJECT_QUERY_ORDER.
    let mut query_order: Vec<String> = Vec::new();
    let mut rest: Vec<String> = Vec::new();
    for name in &task_order {
        let is_md_child = input
            .objects
            .get(name)
            .map(|d| d.lookup_fields().any(|f| f.is_master_detail))
            .unwrap_or(false);
        let bounded = !input.process_all.contains(name);
        let readonly = input.readonly.contains(name);
        if is_md_child || bounded || readonly {
            query_order.push(name.clone());
        } else {
            rest.push(name.clone());
        }
    }
    query_order.extend(rest);

    bubble_pass(&mut query_order, MAX_BUBBLE_PASSES, |order, i, j| {
        for (right, lefts) in SPECIAL_OBJECT_QUERY_ORDER {
            if order[i] == *right && lefts.contains(&order[j].as_str()) {
                return true;
            }
        }
        false
    });

    // 6. deleteOrder = reverse(taskOrder).
    let delete_order: Vec<String> = task_order.iter().rev().cloned().collect();

    TaskGraph { task_order, query_order, delete_order }
}

/// Generic monotone bubble pass: for each ordered pair `(i, j)` with `i <
/// j`, swap them if `should_swap(order, i, j)`. Repeats until stable or
/// `max_passes` is reached. `should_swap` encodes a partial order, so
/// repeated application terminates (spec §4.2's "guaranteed stable because
/// swaps are monotone under a partial order").
fn bubble_pass(
    order: &mut Vec<String>,
    max_passes: usize,
    should_swap: impl Fn(&[String], usize, usize) -> bool,
) {
    for _ in 0..max_passes {
        let mut changed = false;
        for i in 0..order.len() {
            for j in (i + 1)..order.len() {
                if should_swap(order, i, j) {
                    order.swap(i, j);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldDescriptor, ObjectDescriptor, Operation};

    fn account_contact_table() -> ObjectTable {
        let mut table = ObjectTable::new();
        table.insert(ObjectDescriptor {
            source_name: "Account".into(),
            target_name: "Account".into(),
            external_id: crate::model::ComplexField::parse("Name").unwrap(),
            operation: Operation::Insert,
            fields: vec![],
            priority: 0,
        });
        let mut contact_lookup = FieldDescriptor::lookup("AccountId", "Account");
        contact_lookup.is_master_detail = true;
        table.insert(ObjectDescriptor {
            source_name: "Contact".into(),
            target_name: "Contact".into(),
            external_id: crate::model::ComplexField::parse("LastName").unwrap(),
            operation: Operation::Insert,
            fields: vec![contact_lookup],
            priority: 1,
        });
        table
    }

    #[test]
    fn parent_precedes_child_in_smart_mode() {
        let objects = account_contact_table();
        let input = GraphInput {
            objects: &objects,
            declared_order: vec!["Contact".into(), "Account".into()],
            readonly: HashSet::new(),
            process_all: HashSet::new(),
        };
        let graph = build_task_graph(&input, OrderingMode::Smart);
        let account_idx = graph.task_order.iter().position(|n| n == "Account").unwrap();
        let contact_idx = graph.task_order.iter().position(|n| n == "Contact").unwrap();
        assert!(account_idx < contact_idx);
    }

    #[test]
    fn delete_order_is_reverse_of_task_order() {
        let objects = account_contact_table();
        let input = GraphInput {
            objects: &objects,
            declared_order: vec!["Account".into(), "Contact".into()],
            readonly: HashSet::new(),
            process_all: HashSet::new(),
        };
        let graph = build_task_graph(&input, OrderingMode::Smart);
        let mut expected = graph.task_order.clone();
        expected.reverse();
        assert_eq!(graph.delete_order, expected);
    }

    #[test]
    fn preserve_mode_keeps_declaration_order() {
        let objects = account_contact_table();
        let input = GraphInput {
            objects: &objects,
            declared_order: vec!["Contact".into(), "Account".into()],
            readonly: HashSet::new(),
            process_all: HashSet::new(),
        };
        let graph = build_task_graph(&input, OrderingMode::Preserve);
        assert_eq!(graph.task_order, vec!["Contact".to_string(), "Account".to_string()]);
    }

    #[test]
    fn record_type_is_always_head() {
        let mut objects = account_contact_table();
        objects.insert(ObjectDescriptor {
            source_name: "RecordType".into(),
            target_name: "RecordType".into(),
            external_id: crate::model::ComplexField::parse("DeveloperName").unwrap(),
            operation: Operation::Readonly,
            fields: vec![],
            priority: 0,
        });
        let input = GraphInput {
            objects: &objects,
            declared_order: vec!["Account".into(), "RecordType".into(), "Contact".into()],
            readonly: HashSet::new(),
            process_all: HashSet::new(),
        };
        let graph = build_task_graph(&input, OrderingMode::Smart);
        assert_eq!(graph.task_order[0], "RecordType");
    }

    #[test]
    fn special_query_order_places_junction_object_after_listed_parents() {
        let mut objects = account_contact_table();
        objects.insert(ObjectDescriptor {
            source_name: "AccountContactRelation".into(),
            target_name: "AccountContactRelation".into(),
            external_id: crate::model::ComplexField::parse("Id").unwrap(),
            operation: Operation::Insert,
            fields: vec![],
            priority: 2,
        });
        let input = GraphInput {
            objects: &objects,
            declared_order: vec!["AccountContactRelation".into(), "Account".into(), "Contact".into()],
            readonly: HashSet::new(),
            process_all: HashSet::new(),
        };
        let graph = build_task_graph(&input, OrderingMode::Smart);
        let acr_idx = graph.query_order.iter().position(|n| n == "AccountContactRelation").unwrap();
        let account_idx = graph.query_order.iter().position(|n| n == "Account").unwrap();
        let contact_idx = graph.query_order.iter().position(|n| n == "Contact").unwrap();
        assert!(account_idx < acr_idx);
        assert!(contact_idx < acr_idx);
    }
}
