use fieldgate::batch::RequestItem;
use fieldgate::derived::{ComputedSpec, DerivedSpec};
use fieldgate::modbus::{MockTransport, shared};
use fieldgate::node::DeviceNode;
use fieldgate::registers::ModelLibrary;
use fieldgate::value::Value;
use std::path::Path;
use std::time::Duration;

fn library() -> ModelLibrary {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("models");
    ModelLibrary::load(&dir, &[]).unwrap()
}

fn node(model: &str, mock: &MockTransport) -> DeviceNode {
    let profile = library().get(model).unwrap();
    DeviceNode::new(model, 1, profile, shared(mock.clone()), Duration::ZERO)
}

fn items(names: &[&str]) -> Vec<RequestItem> {
    names.iter().map(|n| RequestItem::from(*n)).collect()
}

#[test]
fn bundled_models_load() {
    let library = library();
    assert_eq!(library.len(), 3);
    for name in ["omron_kmn1", "yaskawa_ga500", "kyuden_battery_72kwh"] {
        assert!(library.get(name).is_some(), "{} missing", name);
    }

    let kmn1 = library.get("omron_kmn1").unwrap();
    assert_eq!(kmn1.model.word_increment(), 2);
    assert!(kmn1.derived.get("Apparent_Power").is_some());
}

#[test]
fn listed_model_files_only() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("models");
    let library = ModelLibrary::load(&dir, &["omron_kmn1.yaml".to_string()]).unwrap();
    assert_eq!(library.len(), 1);
    assert!(ModelLibrary::load(&dir, &["absent.yaml".to_string()]).is_err());
}

fn computed(model: &str, name: &str) -> ComputedSpec {
    let library = library();
    let profile = library.get(model).unwrap();
    match &profile.derived.get(name).unwrap().spec {
        DerivedSpec::Computed(spec) => spec.clone(),
        other => panic!("{} is not computed: {:?}", name, other),
    }
}

#[test]
fn drive_power_constants_keep_full_precision() {
    let close = |a: f64, b: f64| (a - b).abs() < 1e-12;
    let k = 0.91 * 3f64.sqrt();
    assert!(close(computed("yaskawa_ga500", "AC_Power").scale, k / 1000.0));
    assert!(close(computed("yaskawa_ga500", "DC_Current_raw").scale, k));

    let dc = computed("yaskawa_ga500", "DC_Current");
    assert!(close(dc.bias_dependencies[0].0, -4.37 / 0.158));
}

#[tokio::test]
async fn drive_dc_current_estimate() {
    let mock = MockTransport::new();
    mock.set_registers(1, 0x0042, &[1429]);
    mock.set_registers(1, 0x0046, &[300]);
    mock.set_registers(1, 0x154E, &[2000]);

    let mut drive = node("yaskawa_ga500", &mock);
    let report = drive.read(&items(&["AC_Power", "DC_Current"]), None).await;
    assert_eq!(report.degraded_blocks, 0);

    assert_eq!(drive.value("Output_Current"), Some(&Value::Number(10.0)));
    assert_eq!(drive.value("DC_Current_raw"), Some(&Value::Number(10.508)));
    assert_eq!(drive.value("DC_Current"), Some(&Value::Number(10.66)));
    assert_eq!(drive.value("AC_Power"), Some(&Value::Number(3.2)));
}

#[tokio::test]
async fn drive_idle_current_is_clamped() {
    let mock = MockTransport::new();
    // Motor stopped: no output current, bus still charged
    mock.set_registers(1, 0x0046, &[300]);
    mock.set_registers(1, 0x154E, &[0]);

    let mut drive = node("yaskawa_ga500", &mock);
    drive.read(&items(&["DC_Current"]), None).await;
    assert_eq!(drive.value("DC_Current"), Some(&Value::Number(0.0)));
}

#[tokio::test]
async fn battery_cells_compile_into_module_lists() {
    let mock = MockTransport::new();
    let cells: Vec<u16> = (0..12).map(|i| 3300 + i * 10).collect();
    mock.set_registers(1, 0x1101, &cells);
    mock.set_registers(1, 0x1017, &[80]);

    let mut bms = node("kyuden_battery_72kwh", &mock);
    let report = bms
        .read(&items(&["Cell_Voltage_M1", "Temperature_max"]), None)
        .await;
    assert_eq!(report.degraded_blocks, 0);

    let Some(Value::List(module)) = bms.value("Cell_Voltage_M1") else {
        panic!("expected a list");
    };
    assert_eq!(module.len(), 12);
    assert_eq!(module[0], Value::Number(3.3));
    assert_eq!(module[11], Value::Number(3.41));
    assert_eq!(bms.value("Temperature_max"), Some(&Value::Number(25.0)));
}

#[tokio::test]
async fn battery_status_bits_use_discrete_inputs() {
    let mock = MockTransport::new();
    mock.set_registers(1, 0x0005, &[1]);

    let mut bms = node("kyuden_battery_72kwh", &mock);
    bms.read(&items(&["Operation_State", "Error_State"]), None)
        .await;

    assert_eq!(bms.value("Operation_State"), Some(&Value::Number(0.0)));
    assert_eq!(bms.value("Error_State"), Some(&Value::Number(1.0)));
    assert!(mock.calls().iter().all(|c| matches!(
        c,
        fieldgate::modbus::MockCall::Read {
            capability: fieldgate::registers::ReadCapability::DiscreteInputs,
            start: 0,
            count: 6,
            ..
        }
    )));
}
