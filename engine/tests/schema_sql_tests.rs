use partmig_engine::discovery::PartitionDescriptor;
use partmig_engine::schema::{
    child_table_ddl, parent_index_ddl, parent_table_ddl, rule_ddl, rule_name, trigger_ddl,
    trigger_function_ddl, trigger_function_name, trigger_name,
};
use partmig_engine::table_types::{TableTypeCode, ED_SPEC, PH_SPEC, TH_SPEC};

fn ph_descriptor() -> PartitionDescriptor {
    PartitionDescriptor {
        parent: "point_history".to_string(),
        child: "point_history_240921".to_string(),
        code: TableTypeCode::Ph,
        from_date: 1_726_844_400_000,
        to_date: 1_726_930_799_999,
        cluster_index: false,
        estimated_rows: None,
    }
}

fn th_descriptor() -> PartitionDescriptor {
    PartitionDescriptor {
        parent: "trend_history".to_string(),
        child: "trend_history_2409".to_string(),
        code: TableTypeCode::Th,
        from_date: 1_725_116_400_000,
        to_date: 1_727_708_399_999,
        cluster_index: false,
        estimated_rows: None,
    }
}

fn ed_descriptor() -> PartitionDescriptor {
    PartitionDescriptor {
        parent: "environment_data".to_string(),
        child: "environment_data_240201".to_string(),
        code: TableTypeCode::Ed,
        from_date: 1_706_713_200_000,
        to_date: 1_706_799_599_999,
        cluster_index: false,
        estimated_rows: None,
    }
}

#[test]
fn test_parent_ddl_lists_registry_columns() {
    let ddl = parent_table_ddl(&PH_SPEC);
    assert_eq!(
        ddl,
        "CREATE TABLE IF NOT EXISTS point_history (path_id int8, issued_date int8, \
         changed_value varchar(100), connection_status bool);"
    );
}

#[test]
fn test_parent_indexes_per_family() {
    let ph = parent_index_ddl(&PH_SPEC);
    assert_eq!(ph.len(), 1);
    assert_eq!(
        ph[0].1,
        "CREATE INDEX point_history_path_idx ON point_history (path_id, issued_date);"
    );
    let ed = parent_index_ddl(&ED_SPEC);
    assert_eq!(
        ed[0].1,
        "CREATE INDEX environment_data_sensor_idx ON environment_data (sensor_id, station_id);"
    );
}

#[test]
fn test_trigger_function_builds_dynamic_child_name() {
    assert_eq!(trigger_function_name(&PH_SPEC), "point_history_partition_insert");
    assert_eq!(trigger_name(&PH_SPEC), "point_history_insert_trigger");
    let body = trigger_function_ddl(&PH_SPEC);
    assert!(body.contains("CREATE OR REPLACE FUNCTION point_history_partition_insert()"));
    assert!(body.contains("'point_history_' || to_char(to_timestamp(NEW.issued_date / 1000.0), 'YYMMDD')"));
    assert!(body.contains("EXECUTE 'INSERT INTO ' || quote_ident(child_name)"));
    assert!(body.contains("RETURN NULL;"));

    let trigger = trigger_ddl(&PH_SPEC);
    assert_eq!(
        trigger,
        "CREATE TRIGGER point_history_insert_trigger BEFORE INSERT ON point_history \
         FOR EACH ROW EXECUTE PROCEDURE point_history_partition_insert();"
    );
}

#[test]
fn test_child_ddl_inherits_with_range_check() {
    let ddl = child_table_ddl(&PH_SPEC, &ph_descriptor()).unwrap();
    assert_eq!(
        ddl,
        "CREATE TABLE point_history_240921 (\
         CHECK (issued_date BETWEEN 1726844400000 AND 1726930799999), \
         PRIMARY KEY (path_id, issued_date)\
         ) INHERITS (point_history);"
    );
}

#[test]
fn test_rule_names_follow_child() {
    // monthly children yield the rule_<parent>_<YYMM> shape
    assert_eq!(rule_name("trend_history_2409"), "rule_trend_history_2409");
    assert_eq!(rule_name("point_history_240921"), "rule_point_history_240921");
}

#[test]
fn test_ms_rule_uses_bigint_literals() {
    let ddl = rule_ddl(&TH_SPEC, &th_descriptor()).unwrap();
    assert_eq!(
        ddl,
        "CREATE RULE rule_trend_history_2409 AS ON INSERT TO trend_history \
         WHERE (new.issued_date BETWEEN 1725116400000 AND 1727708399999) \
         DO INSTEAD INSERT INTO trend_history_2409 VALUES (NEW.*);"
    );
}

#[test]
fn test_timestamp_rule_uses_quoted_literals() {
    let ddl = rule_ddl(&ED_SPEC, &ed_descriptor()).unwrap();
    assert!(ddl.starts_with(
        "CREATE RULE rule_environment_data_240201 AS ON INSERT TO environment_data \
         WHERE (new.issued_date BETWEEN '"
    ));
    assert!(ddl.contains("'::timestamp without time zone AND '"));
    assert!(ddl.ends_with(
        "'::timestamp without time zone) \
         DO INSTEAD INSERT INTO environment_data_240201 VALUES (NEW.*);"
    ));
}

#[test]
fn test_renderers_are_pure() {
    let first = child_table_ddl(&PH_SPEC, &ph_descriptor()).unwrap();
    let second = child_table_ddl(&PH_SPEC, &ph_descriptor()).unwrap();
    assert_eq!(first, second);
}
