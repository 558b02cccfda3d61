// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing order resolution.

use {
    crate::{
        code_item::{CodeItemTree, ItemId},
        error::DeepSignError,
    },
    std::collections::HashSet,
};

fn check_links(tree: &CodeItemTree) -> Result<(), DeepSignError> {
    for (id, item) in tree.iter() {
        match (id, item.parent) {
            (0, None) => {}
            (0, Some(_)) => {
                return Err(DeepSignError::Planning(
                    "root item has a parent".to_string(),
                ))
            }
            (_, None) => {
                return Err(DeepSignError::Planning(format!(
                    "{} has no parent",
                    item.display_name()
                )))
            }
            (_, Some(parent)) => {
                let linked = tree
                    .get(parent)
                    .map(|p| p.children.contains(&id))
                    .unwrap_or(false);

                if !linked {
                    return Err(DeepSignError::Planning(format!(
                        "{} is not a child of its parent",
                        item.display_name()
                    )));
                }
            }
        }

        for child in &item.children {
            if tree.get(*child).and_then(|c| c.parent) != Some(id) {
                return Err(DeepSignError::Planning(format!(
                    "child {} of {} does not point back to it",
                    child,
                    item.display_name()
                )));
            }
        }
    }

    Ok(())
}

/// Linearize a containment tree leaves first.
///
/// Every item appears after all of its transitive children. Siblings are
/// visited in lexicographic path order. Fails if the tree is not a proper
/// forest rooted at the first item.
pub fn resolve_order(tree: &CodeItemTree) -> Result<Vec<ItemId>, DeepSignError> {
    let root = match tree.root() {
        Some(root) => root,
        None => return Ok(vec![]),
    };

    check_links(tree)?;

    let mut order = Vec::with_capacity(tree.len());
    let mut seen = HashSet::new();
    let mut stack = vec![(root, false)];

    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            order.push(id);
            continue;
        }

        if !seen.insert(id) {
            return Err(DeepSignError::Planning(format!(
                "item {} is reachable more than once",
                id
            )));
        }

        let item = tree
            .get(id)
            .ok_or_else(|| DeepSignError::Planning(format!("dangling item id {}", id)))?;

        let mut children = item.children.clone();
        children.sort_by(|a, b| {
            let a = tree.get(*a).map(|i| &i.path);
            let b = tree.get(*b).map(|i| &i.path);
            a.cmp(&b)
        });

        stack.push((id, true));
        // Reversed so the lexicographically first sibling is popped first.
        stack.extend(children.into_iter().rev().map(|c| (c, false)));
    }

    if order.len() != tree.len() {
        return Err(DeepSignError::Planning(format!(
            "{} of {} items are unreachable from the root",
            tree.len() - order.len(),
            tree.len()
        )));
    }

    Ok(order)
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::code_item::{testutil::item, CodeItemKind, SignatureState},
    };

    fn sample_tree() -> CodeItemTree {
        let mut tree = CodeItemTree::default();
        let app = tree
            .insert(
                item("Foo.app", CodeItemKind::ApplicationBundle, SignatureState::Absent),
                None,
            )
            .unwrap();
        // Inserted out of lexicographic order on purpose.
        let plugin = tree
            .insert(
                item(
                    "Foo.app/Contents/PlugIns/Ext.plugin",
                    CodeItemKind::PluginBundle,
                    SignatureState::Absent,
                ),
                Some(app),
            )
            .unwrap();
        let framework = tree
            .insert(
                item(
                    "Foo.app/Contents/Frameworks/Bar.framework",
                    CodeItemKind::Framework,
                    SignatureState::Absent,
                ),
                Some(app),
            )
            .unwrap();
        tree.insert(
            item(
                "Foo.app/Contents/Frameworks/Bar.framework/Versions/A/libz.dylib",
                CodeItemKind::LoadableExecutable,
                SignatureState::Absent,
            ),
            Some(framework),
        )
        .unwrap();
        tree.insert(
            item(
                "Foo.app/Contents/PlugIns/Ext.plugin/Contents/MacOS/helper",
                CodeItemKind::LoadableExecutable,
                SignatureState::Absent,
            ),
            Some(plugin),
        )
        .unwrap();

        tree
    }

    #[test]
    fn leaves_first() -> Result<(), DeepSignError> {
        let tree = sample_tree();
        let order = resolve_order(&tree)?;

        assert_eq!(order, vec![3, 2, 4, 1, 0]);

        for (position, id) in order.iter().enumerate() {
            for child in tree.descendants(*id) {
                let child_position = order.iter().position(|x| *x == child).unwrap();
                assert!(child_position < position);
            }
        }

        Ok(())
    }

    #[test]
    fn empty_tree() -> Result<(), DeepSignError> {
        assert!(resolve_order(&CodeItemTree::default())?.is_empty());
        Ok(())
    }

    #[test]
    fn broken_back_reference() {
        let mut tree = sample_tree();
        tree.items_mut()[3].parent = Some(1);

        assert!(matches!(
            resolve_order(&tree),
            Err(DeepSignError::Planning(_))
        ));
    }

    #[test]
    fn cycle() {
        let mut tree = sample_tree();
        tree.items_mut()[0].parent = Some(4);
        tree.items_mut()[4].children.push(0);

        assert!(matches!(
            resolve_order(&tree),
            Err(DeepSignError::Planning(_))
        ));
    }

    #[test]
    fn shared_child() {
        let mut tree = sample_tree();
        // The dylib claims two parents' child lists but points back to one.
        tree.items_mut()[1].children.push(3);

        assert!(matches!(
            resolve_order(&tree),
            Err(DeepSignError::Planning(_))
        ));
    }
}
