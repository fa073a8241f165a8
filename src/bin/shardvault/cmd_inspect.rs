use anyhow::Result;
use std::path::PathBuf;

use shardvault::store::MvccStore;

use super::util::display_text;

pub fn exec(path: PathBuf) -> Result<()> {
    let store = MvccStore::open(&path)?;
    let st = store.state();
    let ts = st.max_ts();

    println!("Group dir {}:", path.display());
    println!("  group_id  = {}", store.group_id());
    println!("  keys      = {}", st.key_count());
    println!("  versions  = {}", st.version_count());
    println!("  max_ts    = {}", ts);

    let types = st.types(ts);
    println!("  types     = {:?}", types);
    for p in st.predicates(ts) {
        let ty = st.schema_of(&p, ts).unwrap_or_default();
        let values = st.predicate_values(&p, ts);
        println!("  {} ({}): {} values", p, ty, values.len());
        for (uid, v) in values.iter().take(5) {
            println!("      0x{:x} = {}", uid, display_text(v));
        }
    }
    Ok(())
}
