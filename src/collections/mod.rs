pub mod b_plus_tree_map;
