use super::ItemDescriptor;

/// The dress-up clothing set: four tops, four bottoms, four accessories.
pub fn builtin_items() -> Vec<ItemDescriptor> {
    let mut items = Vec::new();

    let mut insert = |id: &str, label: &str| {
        items.push(ItemDescriptor::new(id, label));
    };

    insert(
        "01_top_flame_bowling_shirt",
        "black bowling shirt with red-to-yellow flame graphic rising from the hem, black buttons",
    );
    insert(
        "02_top_dirty_white_tshirt",
        "worn dirty-white t-shirt, slightly stretched collar",
    );
    insert(
        "03_top_plaid_flannel",
        "blue/red plaid flannel overshirt, open front, wrinkled",
    );
    insert(
        "04_top_worn_denim_jacket",
        "faded blue denim jacket, heavily worn seams",
    );
    insert(
        "05_bottom_track_pants",
        "dark gray track pants with white side stripes, drawstring waist",
    );
    insert(
        "06_bottom_worn_jeans",
        "very worn blue jeans, small knee tear, frayed hem",
    );
    insert(
        "07_bottom_khaki_cargo_shorts",
        "khaki cargo shorts, heavy use, large pockets",
    );
    insert(
        "08_bottom_carpenter_pants",
        "brown carpenter/work pants, light stains, tool pocket",
    );
    insert(
        "09_accessory_trucker_cap",
        "worn trucker cap black/gray, no logo",
    );
    insert(
        "10_accessory_gold_chain",
        "simple medium-thick gold chain necklace",
    );
    insert(
        "11_accessory_worn_sneakers",
        "worn white/gray sneakers, slightly dirty sole",
    );
    insert(
        "12_accessory_work_boots",
        "brown work boots, scuffed leather, thick sole",
    );

    items
}
